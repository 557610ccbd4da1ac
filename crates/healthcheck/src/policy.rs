//! Active health check policies.

use crate::health_updater::DestinationHealthUpdater;
use crate::types::{DestinationProbingResult, NewActiveDestinationHealth};
use dashmap::DashMap;
use model::{ClusterChangeListener, ClusterState, DestinationHealth, id_key};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the built-in active policy
pub const CONSECUTIVE_FAILURES: &str = "ConsecutiveFailures";

/// Cluster metadata key overriding the failure threshold
pub const THRESHOLD_METADATA_KEY: &str = "ConsecutiveFailuresHealthPolicy.Threshold";

const DEFAULT_THRESHOLD: u32 = 2;

/// Turns the results of one probing round into active health verdicts.
pub trait ActiveHealthCheckPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per round with a result for every destination probed.
    fn probing_completed(&self, cluster: &Arc<ClusterState>, results: &[DestinationProbingResult]);
}

/// Marks a destination unhealthy after a number of consecutive failed probes.
///
/// Any 2xx response resets the count and marks the destination healthy. The
/// threshold comes from cluster metadata, defaulting to 2.
pub struct ConsecutiveFailuresHealthPolicy {
    default_threshold: u32,
    updater: Arc<DestinationHealthUpdater>,
    failures: DashMap<(String, String), u32>,
}

impl ConsecutiveFailuresHealthPolicy {
    pub fn new(updater: Arc<DestinationHealthUpdater>) -> Self {
        Self::with_default_threshold(updater, DEFAULT_THRESHOLD)
    }

    pub fn with_default_threshold(updater: Arc<DestinationHealthUpdater>, default_threshold: u32) -> Self {
        Self {
            default_threshold: default_threshold.max(1),
            updater,
            failures: DashMap::new(),
        }
    }

    fn threshold(&self, cluster: &ClusterState) -> u32 {
        let model = cluster.model();
        match model.config.metadata.get(THRESHOLD_METADATA_KEY) {
            None => self.default_threshold,
            Some(value) => match value.trim().parse::<u32>() {
                Ok(threshold) if threshold > 0 => threshold,
                _ => {
                    warn!(
                        cluster_id = %cluster.cluster_id(),
                        value = %value,
                        "Invalid failure threshold, using default"
                    );
                    self.default_threshold
                }
            },
        }
    }
}

impl ActiveHealthCheckPolicy for ConsecutiveFailuresHealthPolicy {
    fn name(&self) -> &str {
        CONSECUTIVE_FAILURES
    }

    fn probing_completed(&self, cluster: &Arc<ClusterState>, results: &[DestinationProbingResult]) {
        let threshold = self.threshold(cluster);
        let cluster_key = id_key(cluster.cluster_id());
        let mut verdicts = Vec::with_capacity(results.len());

        for result in results {
            let key = (cluster_key.clone(), id_key(result.destination.destination_id()));

            let health = if result.is_success() {
                self.failures.remove(&key);
                DestinationHealth::Healthy
            } else {
                let mut count = self.failures.entry(key).or_insert(0);
                *count += 1;
                debug!(
                    cluster_id = %cluster.cluster_id(),
                    destination_id = %result.destination.destination_id(),
                    consecutive = *count,
                    threshold,
                    "Probe failed"
                );
                if *count >= threshold {
                    DestinationHealth::Unhealthy
                } else {
                    DestinationHealth::Healthy
                }
            };

            verdicts.push(NewActiveDestinationHealth::new(result.destination.clone(), health));
        }

        // Forget destinations no longer probed in this cluster.
        let probed: HashSet<String> = results
            .iter()
            .map(|r| id_key(r.destination.destination_id()))
            .collect();
        self.failures
            .retain(|(cluster_id, destination_id), _| {
                cluster_id != &cluster_key || probed.contains(destination_id)
            });

        self.updater.set_active(cluster, &verdicts);
    }
}

impl ClusterChangeListener for ConsecutiveFailuresHealthPolicy {
    fn on_cluster_added(&self, _cluster: &Arc<ClusterState>) {}

    fn on_cluster_changed(&self, cluster: &Arc<ClusterState>) {
        forget_destinations(&self.failures, cluster, false);
    }

    fn on_cluster_removed(&self, cluster: &Arc<ClusterState>) {
        forget_destinations(&self.failures, cluster, true);
    }
}

/// Drop per-destination entries of `cluster`: all of them when the cluster
/// was removed, otherwise those of destinations it no longer has.
pub(crate) fn forget_destinations<V>(
    entries: &DashMap<(String, String), V>,
    cluster: &ClusterState,
    removed: bool,
) {
    let cluster_key = id_key(cluster.cluster_id());
    entries.retain(|(cluster_id, destination_id), _| {
        cluster_id != &cluster_key
            || (!removed && cluster.destinations().contains_key(destination_id))
    });
}
