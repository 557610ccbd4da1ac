//! Configuration filters run before validation.

use async_trait::async_trait;
use common::Result;
use model::{ClusterConfig, RouteConfig};

/// Mutation hook applied to every cluster and route of a snapshot.
///
/// Filters run in registration order. An error aborts the reload of the
/// provider that supplied the snapshot.
#[async_trait]
pub trait ProxyConfigFilter: Send + Sync {
    async fn configure_cluster(&self, cluster: ClusterConfig) -> Result<ClusterConfig> {
        Ok(cluster)
    }

    /// `cluster` is the filtered cluster the route points at, if any.
    async fn configure_route(
        &self,
        route: RouteConfig,
        _cluster: Option<&ClusterConfig>,
    ) -> Result<RouteConfig> {
        Ok(route)
    }
}
