//! Route runtime state and derived forwarding endpoints.

use crate::cluster::ClusterState;
use crate::config::{RouteConfig, RouteMatch};
use arc_swap::{ArcSwap, ArcSwapOption};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Revision recorded for routes without a cluster. Cluster revisions start at 1.
pub const NO_CLUSTER_REVISION: u64 = 0;

/// Immutable configuration snapshot of a route
#[derive(Debug, Clone)]
pub struct RouteModel {
    pub config: RouteConfig,

    /// Cluster the route forwards to; `None` if the referenced id is unknown
    pub cluster: Option<Arc<ClusterState>>,
}

impl RouteModel {
    pub fn new(config: RouteConfig, cluster: Option<Arc<ClusterState>>) -> Self {
        Self { config, cluster }
    }
}

/// Forwarding endpoint derived from a route, consumed by the request router.
#[derive(Debug)]
pub struct RouteEndpoint {
    pub route_id: String,
    pub order: i32,
    pub matcher: RouteMatch,
    pub model: Arc<RouteModel>,
}

impl RouteEndpoint {
    fn from_model(route_id: &str, model: Arc<RouteModel>) -> Self {
        Self {
            route_id: route_id.to_string(),
            order: model.config.order.unwrap_or(0),
            matcher: model.config.matcher.clone(),
            model,
        }
    }

    /// Cluster requests matching this endpoint go to, if it exists.
    pub fn cluster(&self) -> Option<&Arc<ClusterState>> {
        self.model.cluster.as_ref()
    }
}

/// Runtime state of a route
#[derive(Debug)]
pub struct RouteState {
    route_id: String,
    model: ArcSwap<RouteModel>,
    cluster_revision: AtomicU64,
    cached_endpoint: ArcSwapOption<RouteEndpoint>,
}

impl RouteState {
    pub fn new(route_id: impl Into<String>, model: RouteModel) -> Self {
        let revision = observed_revision(model.cluster.as_ref());
        Self {
            route_id: route_id.into(),
            model: ArcSwap::from_pointee(model),
            cluster_revision: AtomicU64::new(revision),
            cached_endpoint: ArcSwapOption::empty(),
        }
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn model(&self) -> Arc<RouteModel> {
        self.model.load_full()
    }

    /// Cluster revision observed when the model was last set.
    pub fn cluster_revision(&self) -> u64 {
        self.cluster_revision.load(Ordering::Acquire)
    }

    /// Whether applying `config` against `cluster` would change this route.
    ///
    /// True if the cluster identity differs, the cluster changed shape since
    /// the last rebuild, or the route's own configuration differs.
    pub fn needs_update(&self, config: &RouteConfig, cluster: Option<&Arc<ClusterState>>) -> bool {
        let model = self.model();
        let same_cluster = match (model.cluster.as_ref(), cluster) {
            (Some(current), Some(new)) => Arc::ptr_eq(current, new),
            (None, None) => true,
            _ => false,
        };

        !same_cluster
            || self.cluster_revision() != observed_revision(cluster)
            || model.config != *config
    }

    /// Replace the model and drop the cached endpoint.
    pub fn update(&self, model: RouteModel) {
        let revision = observed_revision(model.cluster.as_ref());
        self.model.store(Arc::new(model));
        self.cluster_revision.store(revision, Ordering::Release);
        self.cached_endpoint.store(None);
    }

    /// Derived endpoint, built on first use after each update.
    pub fn endpoint(&self) -> Arc<RouteEndpoint> {
        if let Some(endpoint) = self.cached_endpoint.load_full() {
            return endpoint;
        }

        let endpoint = Arc::new(RouteEndpoint::from_model(&self.route_id, self.model()));
        self.cached_endpoint.store(Some(endpoint.clone()));
        endpoint
    }
}

fn observed_revision(cluster: Option<&Arc<ClusterState>>) -> u64 {
    cluster.map_or(NO_CLUSTER_REVISION, |c| c.revision())
}
