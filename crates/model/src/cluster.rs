//! Cluster runtime state.

use crate::concurrency::ConcurrencyCounter;
use crate::config::{ClusterConfig, HttpClientConfig};
use crate::destination::DestinationState;
use crate::id_key;
use arc_swap::ArcSwap;
use common::{Error, Result};
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;

/// Maximum number of concurrent destination recomputations per cluster.
pub(crate) const MAX_CONCURRENT_UPDATES: usize = 2;

/// Immutable configuration snapshot of a cluster
#[derive(Debug, Clone)]
pub struct ClusterModel {
    pub config: ClusterConfig,

    /// Outbound client used for forwarding and active probes
    pub http_client: reqwest::Client,
}

impl ClusterModel {
    pub fn new(config: ClusterConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
        }
    }

    /// Whether `config` differs from this model outside of its destinations.
    pub fn has_config_changed(&self, config: &ClusterConfig) -> bool {
        !self.config.equals_excluding_destinations(config)
    }
}

/// Build the outbound HTTP client for a cluster.
pub fn build_http_client(config: Option<&HttpClientConfig>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(config) = config {
        builder = builder.danger_accept_invalid_certs(config.danger_accept_invalid_certificates);
        if let Some(max) = config.max_idle_connections_per_server {
            builder = builder.pool_max_idle_per_host(max);
        }
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
    }

    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))
}

/// Destination sets of a cluster, replaced as one snapshot.
#[derive(Debug, Clone, Default)]
pub struct ClusterDestinationsState {
    /// Every destination, ordered by id
    pub all_destinations: Vec<Arc<DestinationState>>,

    /// Destinations eligible for new requests; a subset of `all_destinations`
    pub available_destinations: Vec<Arc<DestinationState>>,
}

/// Admission control for destination recomputation.
///
/// Holds the per-cluster permits and the exclusion lock used by
/// [`crate::ClusterDestinationsUpdater`].
#[derive(Debug)]
pub(crate) struct UpdateGate {
    pub(crate) permits: Semaphore,
    pub(crate) lock: parking_lot::Mutex<()>,
}

impl Default for UpdateGate {
    fn default() -> Self {
        Self {
            permits: Semaphore::new(MAX_CONCURRENT_UPDATES),
            lock: parking_lot::Mutex::new(()),
        }
    }
}

/// Runtime state of a cluster.
///
/// Readers on the request path load `model` and `destinations_state` without
/// locking. Equality and hashing are by identity.
#[derive(Debug)]
pub struct ClusterState {
    cluster_id: String,
    model: ArcSwap<ClusterModel>,
    destinations: DashMap<String, Arc<DestinationState>>,
    destinations_state: ArcSwap<ClusterDestinationsState>,
    revision: AtomicU64,
    concurrency: ConcurrencyCounter,
    pub(crate) update_gate: UpdateGate,
}

impl ClusterState {
    /// Create a cluster with no destinations. The first revision is 1.
    pub fn new(cluster_id: impl Into<String>, model: ClusterModel) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            model: ArcSwap::from_pointee(model),
            destinations: DashMap::new(),
            destinations_state: ArcSwap::from_pointee(ClusterDestinationsState::default()),
            revision: AtomicU64::new(1),
            concurrency: ConcurrencyCounter::default(),
            update_gate: UpdateGate::default(),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Current configuration snapshot.
    pub fn model(&self) -> Arc<ClusterModel> {
        self.model.load_full()
    }

    /// Swap in a new model and bump the revision. Returns the new revision.
    pub fn replace_model(&self, model: ClusterModel) -> u64 {
        self.model.store(Arc::new(model));
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Swap in a model whose configuration differs only in its destinations.
    ///
    /// The revision is left unchanged.
    pub fn refresh_model(&self, model: ClusterModel) {
        self.model.store(Arc::new(model));
    }

    /// Revision of the current model.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Destinations keyed by normalized destination id.
    pub fn destinations(&self) -> &DashMap<String, Arc<DestinationState>> {
        &self.destinations
    }

    pub fn destination(&self, destination_id: &str) -> Option<Arc<DestinationState>> {
        self.destinations
            .get(&id_key(destination_id))
            .map(|entry| entry.value().clone())
    }

    /// Latest computed destination sets.
    pub fn destinations_state(&self) -> Arc<ClusterDestinationsState> {
        self.destinations_state.load_full()
    }

    pub(crate) fn set_destinations_state(&self, state: ClusterDestinationsState) {
        self.destinations_state.store(Arc::new(state));
    }

    pub fn concurrency(&self) -> &ConcurrencyCounter {
        &self.concurrency
    }
}

impl PartialEq for ClusterState {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for ClusterState {}

impl Hash for ClusterState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DestinationConfig, HttpClientConfig};
    use crate::destination::DestinationModel;
    use std::time::Duration;

    fn cluster(id: &str) -> ClusterState {
        let config = ClusterConfig {
            cluster_id: id.to_string(),
            ..Default::default()
        };
        ClusterState::new(id, ClusterModel::new(config, reqwest::Client::new()))
    }

    #[test]
    fn test_replace_model_bumps_revision() {
        let cluster = cluster("c1");
        assert_eq!(cluster.revision(), 1);

        let mut config = cluster.model().config.clone();
        config.load_balancing_policy = Some("RoundRobin".to_string());
        let revision = cluster.replace_model(ClusterModel::new(config, reqwest::Client::new()));

        assert_eq!(revision, 2);
        assert_eq!(cluster.revision(), 2);
        assert_eq!(
            cluster.model().config.load_balancing_policy.as_deref(),
            Some("RoundRobin")
        );
    }

    #[test]
    fn test_refresh_model_keeps_revision() {
        let cluster = cluster("c1");
        let mut config = cluster.model().config.clone();
        config.destinations.insert(
            "d1".to_string(),
            DestinationConfig {
                address: "http://10.0.0.1/".to_string(),
                ..Default::default()
            },
        );

        cluster.refresh_model(ClusterModel::new(config, reqwest::Client::new()));

        assert_eq!(cluster.revision(), 1);
        assert_eq!(cluster.model().config.destinations.len(), 1);
    }

    #[test]
    fn test_destination_lookup_is_case_insensitive() {
        let cluster = cluster("c1");
        let dest = Arc::new(DestinationState::new(
            "Dest-A",
            DestinationModel::new(DestinationConfig {
                address: "http://10.0.0.1/".to_string(),
                ..Default::default()
            }),
        ));
        cluster.destinations().insert(id_key("Dest-A"), dest.clone());

        let found = cluster.destination("dest-a").unwrap();
        assert!(Arc::ptr_eq(&found, &dest));
        assert!(cluster.destination("dest-b").is_none());
    }

    #[test]
    fn test_model_change_detection_ignores_destinations() {
        let cluster = cluster("c1");
        let mut config = cluster.model().config.clone();
        config.destinations.insert(
            "d1".to_string(),
            DestinationConfig {
                address: "http://10.0.0.1/".to_string(),
                ..Default::default()
            },
        );
        assert!(!cluster.model().has_config_changed(&config));

        config.http_client = Some(HttpClientConfig {
            connect_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        assert!(cluster.model().has_config_changed(&config));
    }

    #[test]
    fn test_build_http_client_with_settings() {
        let config = HttpClientConfig {
            danger_accept_invalid_certificates: true,
            max_idle_connections_per_server: Some(16),
            connect_timeout: Some(Duration::from_secs(3)),
        };
        assert!(build_http_client(Some(&config)).is_ok());
        assert!(build_http_client(None).is_ok());
    }
}
