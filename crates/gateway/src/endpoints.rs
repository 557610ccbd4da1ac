//! Published route endpoints.

use model::RouteEndpoint;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Immutable set of route endpoints as seen by the data plane.
///
/// A new snapshot replaces the previous one wholesale. The previous
/// snapshot's `change_token` fires right after the swap.
#[derive(Debug, Default)]
pub struct EndpointSnapshot {
    endpoints: Vec<Arc<RouteEndpoint>>,
    change_token: CancellationToken,
}

impl EndpointSnapshot {
    /// Sorts endpoints by route order, then route id.
    pub fn new(mut endpoints: Vec<Arc<RouteEndpoint>>) -> Self {
        endpoints.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then_with(|| a.route_id.cmp(&b.route_id))
        });
        Self {
            endpoints,
            change_token: CancellationToken::new(),
        }
    }

    pub fn endpoints(&self) -> &[Arc<RouteEndpoint>] {
        &self.endpoints
    }

    pub fn endpoint(&self, route_id: &str) -> Option<&Arc<RouteEndpoint>> {
        self.endpoints
            .iter()
            .find(|e| e.route_id.eq_ignore_ascii_case(route_id))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Fires once this snapshot has been superseded
    pub fn change_token(&self) -> &CancellationToken {
        &self.change_token
    }
}
