//! Runtime model of the gateway: clusters, destinations and routes.
//!
//! Every entity pairs a configuration snapshot, replaced wholesale through
//! `ArcSwap`, with state that changes independently of configuration
//! (destination health, revisions, in-flight counters). Readers on the
//! request path never take a lock.
//!
//! The [`ClusterDestinationsUpdater`] keeps each cluster's set of available
//! destinations in step with health and configuration changes.

pub mod cluster;
pub mod concurrency;
pub mod config;
pub mod destination;
pub mod destinations;
pub mod listener;
pub mod route;

pub use cluster::{ClusterDestinationsState, ClusterModel, ClusterState, build_http_client};
pub use concurrency::{ConcurrencyCounter, ConcurrencyGuard};
pub use config::{
    ActiveHealthCheckConfig, ClusterConfig, DestinationConfig, HealthCheckConfig,
    HttpClientConfig, PassiveHealthCheckConfig, RouteConfig, RouteMatch,
};
pub use destination::{DestinationHealth, DestinationHealthState, DestinationModel, DestinationState};
pub use destinations::{AvailableDestinationsPolicy, ClusterDestinationsUpdater};
pub use listener::{ClusterChange, ClusterChangeListener, notify_listeners};
pub use route::{RouteEndpoint, RouteModel, RouteState};

/// Normalize a cluster, route or destination id for use as a map key.
///
/// Ids are compared case-insensitively.
pub fn id_key(id: &str) -> String {
    id.to_ascii_lowercase()
}
