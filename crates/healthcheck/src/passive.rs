//! Passive health check policies.
//!
//! Passive checks watch proxied traffic instead of sending probes. The
//! request path reports each outcome and the policy decides whether the
//! destination should stop receiving traffic for a while.

use crate::health_updater::DestinationHealthUpdater;
use crate::policy::forget_destinations;
use dashmap::DashMap;
use model::{ClusterChangeListener, ClusterState, DestinationHealth, DestinationState, id_key};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Name of the built-in passive policy
pub const TRANSPORT_FAILURE_RATE: &str = "TransportFailureRate";

/// Cluster metadata key overriding the failure rate limit
pub const RATE_LIMIT_METADATA_KEY: &str = "TransportFailureRateHealthPolicy.RateLimit";

/// Outcome of one proxied request, as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    /// Connection, TLS or timeout failure before a response arrived
    TransportFailure,
}

/// Evaluates proxied request outcomes for one destination.
pub trait PassiveHealthCheckPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn request_proxied(
        &self,
        cluster: &Arc<ClusterState>,
        destination: &Arc<DestinationState>,
        outcome: ProxyOutcome,
    );
}

/// Settings of [`TransportFailureRateHealthPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportFailureRateOptions {
    /// Sliding window over which the failure rate is computed
    #[serde(with = "humantime_serde")]
    pub detection_window: Duration,

    /// Fewer requests than this in the window never trip the policy
    pub min_requests: usize,

    /// Failure rate at or above which the destination is marked unhealthy
    pub default_failure_rate_limit: f64,

    /// Used when the cluster does not set a reactivation period
    #[serde(with = "humantime_serde")]
    pub default_reactivation_period: Duration,
}

impl Default for TransportFailureRateOptions {
    fn default() -> Self {
        Self {
            detection_window: Duration::from_secs(60),
            min_requests: 10,
            default_failure_rate_limit: 0.3,
            default_reactivation_period: Duration::from_secs(10),
        }
    }
}

/// Marks a destination passively unhealthy when the share of transport
/// failures in the detection window reaches the rate limit.
pub struct TransportFailureRateHealthPolicy {
    options: TransportFailureRateOptions,
    updater: Arc<DestinationHealthUpdater>,
    history: DashMap<(String, String), VecDeque<(Instant, bool)>>,
}

impl TransportFailureRateHealthPolicy {
    pub fn new(options: TransportFailureRateOptions, updater: Arc<DestinationHealthUpdater>) -> Self {
        Self {
            options,
            updater,
            history: DashMap::new(),
        }
    }

    fn rate_limit(&self, cluster: &ClusterState) -> f64 {
        let model = cluster.model();
        match model.config.metadata.get(RATE_LIMIT_METADATA_KEY) {
            None => self.options.default_failure_rate_limit,
            Some(value) => match value.trim().parse::<f64>() {
                Ok(limit) if (0.0..=1.0).contains(&limit) => limit,
                _ => {
                    warn!(
                        cluster_id = %cluster.cluster_id(),
                        value = %value,
                        "Invalid failure rate limit, using default"
                    );
                    self.options.default_failure_rate_limit
                }
            },
        }
    }

    /// Record an outcome and return the failure rate if enough samples exist.
    fn record(&self, key: (String, String), failed: bool) -> Option<f64> {
        let now = Instant::now();
        let mut samples = self.history.entry(key).or_default();

        samples.push_back((now, failed));
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > self.options.detection_window {
                samples.pop_front();
            } else {
                break;
            }
        }

        if samples.len() < self.options.min_requests.max(1) {
            return None;
        }

        let failures = samples.iter().filter(|(_, failed)| *failed).count();
        Some(failures as f64 / samples.len() as f64)
    }
}

impl PassiveHealthCheckPolicy for TransportFailureRateHealthPolicy {
    fn name(&self) -> &str {
        TRANSPORT_FAILURE_RATE
    }

    fn request_proxied(
        &self,
        cluster: &Arc<ClusterState>,
        destination: &Arc<DestinationState>,
        outcome: ProxyOutcome,
    ) {
        let key = (id_key(cluster.cluster_id()), id_key(destination.destination_id()));
        let failed = outcome == ProxyOutcome::TransportFailure;

        let Some(rate) = self.record(key.clone(), failed) else {
            return;
        };
        let limit = self.rate_limit(cluster);

        let health = if rate >= limit {
            // Start over once the destination comes back.
            self.history.remove(&key);
            DestinationHealth::Unhealthy
        } else {
            DestinationHealth::Healthy
        };

        debug!(
            cluster_id = %cluster.cluster_id(),
            destination_id = %destination.destination_id(),
            rate,
            limit,
            "Transport failure rate evaluated"
        );

        let reactivation_period = cluster
            .model()
            .config
            .passive_health_check()
            .and_then(|p| p.reactivation_period)
            .unwrap_or(self.options.default_reactivation_period);

        self.updater
            .set_passive(cluster, destination, health, reactivation_period);
    }
}

impl ClusterChangeListener for TransportFailureRateHealthPolicy {
    fn on_cluster_added(&self, _cluster: &Arc<ClusterState>) {}

    fn on_cluster_changed(&self, cluster: &Arc<ClusterState>) {
        forget_destinations(&self.history, cluster, false);
    }

    fn on_cluster_removed(&self, cluster: &Arc<ClusterState>) {
        forget_destinations(&self.history, cluster, true);
    }
}
