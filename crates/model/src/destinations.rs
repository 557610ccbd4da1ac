//! Recomputation of the destinations eligible for traffic.
//!
//! Each cluster owns two admission permits and an exclusion lock. Structural
//! updates always wait for a permit. Health-triggered updates only try to
//! take one and return immediately when both are held: the in-flight or
//! queued recomputation reads health values that the caller has already
//! written, so nothing is lost. The permit is released inside the lock so a
//! later caller can never be turned away by a recomputation that has
//! already read its inputs.

use crate::cluster::{ClusterDestinationsState, ClusterState};
use crate::config::ClusterConfig;
use crate::destination::{DestinationHealth, DestinationState};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::SemaphorePermit;
use tracing::{debug, error, warn};

/// Name of the default policy.
pub const HEALTHY_AND_UNKNOWN: &str = "HealthyAndUnknown";

/// Name of the policy that falls back to every destination when none qualify.
pub const HEALTHY_OR_PANIC: &str = "HealthyOrPanic";

/// Selects the destinations that may receive new requests.
pub trait AvailableDestinationsPolicy: Send + Sync {
    /// Name the policy is registered under
    fn name(&self) -> &str;

    /// Compute the available subset of `all` from current health.
    fn get_available_destinations(
        &self,
        config: &ClusterConfig,
        all: &[Arc<DestinationState>],
    ) -> Vec<Arc<DestinationState>>;
}

/// Destinations whose enabled health checks are not Unhealthy.
pub struct HealthyAndUnknownDestinationsPolicy;

impl AvailableDestinationsPolicy for HealthyAndUnknownDestinationsPolicy {
    fn name(&self) -> &str {
        HEALTHY_AND_UNKNOWN
    }

    fn get_available_destinations(
        &self,
        config: &ClusterConfig,
        all: &[Arc<DestinationState>],
    ) -> Vec<Arc<DestinationState>> {
        healthy_or_unknown(config, all)
    }
}

/// Like [`HealthyAndUnknownDestinationsPolicy`], but returns every destination
/// when none qualify.
pub struct HealthyOrPanicDestinationsPolicy;

impl AvailableDestinationsPolicy for HealthyOrPanicDestinationsPolicy {
    fn name(&self) -> &str {
        HEALTHY_OR_PANIC
    }

    fn get_available_destinations(
        &self,
        config: &ClusterConfig,
        all: &[Arc<DestinationState>],
    ) -> Vec<Arc<DestinationState>> {
        let available = healthy_or_unknown(config, all);
        if available.is_empty() && !all.is_empty() {
            warn!(
                cluster_id = %config.cluster_id,
                "No healthy destinations, sending traffic to all of them"
            );
            return all.to_vec();
        }
        available
    }
}

fn healthy_or_unknown(
    config: &ClusterConfig,
    all: &[Arc<DestinationState>],
) -> Vec<Arc<DestinationState>> {
    let active_enabled = config.active_health_check().is_some();
    let passive_enabled = config.passive_health_check().is_some();

    if !active_enabled && !passive_enabled {
        return all.to_vec();
    }

    all.iter()
        .filter(|dest| {
            let health = dest.health();
            !(active_enabled && health.active() == DestinationHealth::Unhealthy)
                && !(passive_enabled && health.passive() == DestinationHealth::Unhealthy)
        })
        .cloned()
        .collect()
}

/// Recomputes `ClusterDestinationsState` for clusters.
pub struct ClusterDestinationsUpdater {
    policies: HashMap<String, Arc<dyn AvailableDestinationsPolicy>>,
}

impl ClusterDestinationsUpdater {
    /// Create an updater with the given policies in addition to the built-ins.
    ///
    /// A policy registered under a built-in name replaces it.
    pub fn new(policies: impl IntoIterator<Item = Arc<dyn AvailableDestinationsPolicy>>) -> Self {
        let builtins: [Arc<dyn AvailableDestinationsPolicy>; 2] = [
            Arc::new(HealthyAndUnknownDestinationsPolicy),
            Arc::new(HealthyOrPanicDestinationsPolicy),
        ];

        let policies = builtins
            .into_iter()
            .chain(policies)
            .map(|policy| (policy.name().to_ascii_lowercase(), policy))
            .collect();

        Self { policies }
    }

    /// Names of all registered policies.
    pub fn policy_names(&self) -> Vec<String> {
        self.policies.values().map(|p| p.name().to_string()).collect()
    }

    /// Recompute after a structural change to the cluster's destinations or
    /// health settings. Waits for admission; never debounced.
    pub async fn update_all_destinations(&self, cluster: &ClusterState) {
        let permit = match cluster.update_gate.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(cluster_id = %cluster.cluster_id(), error = %e, "Update permits closed");
                return;
            }
        };

        self.update_destinations_core(cluster, true, permit);
    }

    /// Recompute after a health change. Returns false when debounced.
    pub fn update_available_destinations(&self, cluster: &ClusterState) -> bool {
        let Ok(permit) = cluster.update_gate.permits.try_acquire() else {
            debug!(cluster_id = %cluster.cluster_id(), "Destination update debounced");
            return false;
        };

        self.update_destinations_core(cluster, false, permit);
        true
    }

    fn update_destinations_core(
        &self,
        cluster: &ClusterState,
        rescan: bool,
        permit: SemaphorePermit<'_>,
    ) {
        let guard = cluster.update_gate.lock.lock();

        let all_destinations = if rescan {
            let mut all: Vec<_> = cluster
                .destinations()
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            all.sort_by(|a, b| a.destination_id().cmp(b.destination_id()));
            all
        } else {
            cluster.destinations_state().all_destinations.clone()
        };

        let model = cluster.model();
        let available_destinations = self.available(&model.config, &all_destinations);

        debug!(
            cluster_id = %cluster.cluster_id(),
            all = all_destinations.len(),
            available = available_destinations.len(),
            "Destinations updated"
        );

        cluster.set_destinations_state(ClusterDestinationsState {
            all_destinations,
            available_destinations,
        });

        drop(permit);
        drop(guard);
    }

    fn available(
        &self,
        config: &ClusterConfig,
        all: &[Arc<DestinationState>],
    ) -> Vec<Arc<DestinationState>> {
        let name = config
            .available_destinations_policy()
            .unwrap_or(HEALTHY_AND_UNKNOWN);

        let Some(policy) = self.policies.get(&name.to_ascii_lowercase()) else {
            warn!(
                cluster_id = %config.cluster_id,
                policy = name,
                "Unknown available destinations policy, using default"
            );
            return healthy_or_unknown(config, all);
        };

        match catch_unwind(AssertUnwindSafe(|| policy.get_available_destinations(config, all))) {
            Ok(available) => available,
            Err(_) => {
                error!(
                    cluster_id = %config.cluster_id,
                    policy = name,
                    "Available destinations policy panicked, using default"
                );
                healthy_or_unknown(config, all)
            }
        }
    }
}

impl Default for ClusterDestinationsUpdater {
    fn default() -> Self {
        Self::new([])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterModel;
    use crate::config::{DestinationConfig, HealthCheckConfig, PassiveHealthCheckConfig};
    use crate::destination::DestinationModel;
    use crate::id_key;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn cluster_with(policy: Option<&str>, ids: &[&str]) -> Arc<ClusterState> {
        let config = ClusterConfig {
            cluster_id: "c1".to_string(),
            health_check: Some(HealthCheckConfig {
                active: None,
                passive: Some(PassiveHealthCheckConfig {
                    enabled: true,
                    ..Default::default()
                }),
                available_destinations_policy: policy.map(str::to_string),
            }),
            ..Default::default()
        };
        let cluster = Arc::new(ClusterState::new(
            "c1",
            ClusterModel::new(config, reqwest::Client::new()),
        ));
        for id in ids {
            let dest = DestinationState::new(
                *id,
                DestinationModel::new(DestinationConfig {
                    address: format!("http://{}.local/", id),
                    ..Default::default()
                }),
            );
            cluster.destinations().insert(id_key(id), Arc::new(dest));
        }
        cluster
    }

    fn ids(destinations: &[Arc<DestinationState>]) -> Vec<&str> {
        destinations.iter().map(|d| d.destination_id()).collect()
    }

    /// Counts recomputations and holds each one open for `delay`.
    struct SlowCountingPolicy {
        runs: AtomicUsize,
        delay: Duration,
    }

    impl AvailableDestinationsPolicy for SlowCountingPolicy {
        fn name(&self) -> &str {
            "SlowCounting"
        }

        fn get_available_destinations(
            &self,
            config: &ClusterConfig,
            all: &[Arc<DestinationState>],
        ) -> Vec<Arc<DestinationState>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            healthy_or_unknown(config, all)
        }
    }

    struct PanickingPolicy;

    impl AvailableDestinationsPolicy for PanickingPolicy {
        fn name(&self) -> &str {
            "Panicking"
        }

        fn get_available_destinations(
            &self,
            _config: &ClusterConfig,
            _all: &[Arc<DestinationState>],
        ) -> Vec<Arc<DestinationState>> {
            panic!("policy failure")
        }
    }

    #[tokio::test]
    async fn test_update_all_collects_sorted_destinations() {
        let cluster = cluster_with(None, &["d2", "d1", "d3"]);
        let updater = ClusterDestinationsUpdater::default();

        updater.update_all_destinations(&cluster).await;

        let state = cluster.destinations_state();
        assert_eq!(ids(&state.all_destinations), vec!["d1", "d2", "d3"]);
        assert_eq!(ids(&state.available_destinations), vec!["d1", "d2", "d3"]);
    }

    #[tokio::test]
    async fn test_unhealthy_destination_is_excluded() {
        let cluster = cluster_with(None, &["d1", "d2"]);
        let updater = ClusterDestinationsUpdater::default();
        updater.update_all_destinations(&cluster).await;

        cluster
            .destination("d2")
            .unwrap()
            .health()
            .set_passive(DestinationHealth::Unhealthy);
        assert!(updater.update_available_destinations(&cluster));

        let state = cluster.destinations_state();
        assert_eq!(ids(&state.all_destinations), vec!["d1", "d2"]);
        assert_eq!(ids(&state.available_destinations), vec!["d1"]);
    }

    #[tokio::test]
    async fn test_disabled_checks_make_everything_available() {
        let cluster = cluster_with(None, &["d1", "d2"]);
        let mut config = cluster.model().config.clone();
        config.health_check = None;
        cluster.replace_model(ClusterModel::new(config, reqwest::Client::new()));

        cluster
            .destination("d1")
            .unwrap()
            .health()
            .set_passive(DestinationHealth::Unhealthy);

        ClusterDestinationsUpdater::default()
            .update_all_destinations(&cluster)
            .await;
        assert_eq!(cluster.destinations_state().available_destinations.len(), 2);
    }

    #[tokio::test]
    async fn test_healthy_or_panic_falls_back_to_all() {
        let cluster = cluster_with(Some(HEALTHY_OR_PANIC), &["d1", "d2"]);
        for id in ["d1", "d2"] {
            cluster
                .destination(id)
                .unwrap()
                .health()
                .set_passive(DestinationHealth::Unhealthy);
        }

        ClusterDestinationsUpdater::default()
            .update_all_destinations(&cluster)
            .await;
        assert_eq!(
            ids(&cluster.destinations_state().available_destinations),
            vec!["d1", "d2"]
        );
    }

    #[tokio::test]
    async fn test_panicking_policy_falls_back_to_default() {
        let cluster = cluster_with(Some("panicking"), &["d1", "d2"]);
        cluster
            .destination("d1")
            .unwrap()
            .health()
            .set_passive(DestinationHealth::Unhealthy);

        let updater = ClusterDestinationsUpdater::new([
            Arc::new(PanickingPolicy) as Arc<dyn AvailableDestinationsPolicy>
        ]);
        updater.update_all_destinations(&cluster).await;

        assert_eq!(
            ids(&cluster.destinations_state().available_destinations),
            vec!["d2"]
        );
    }

    #[test]
    fn test_concurrent_health_updates_run_at_most_twice() {
        let cluster = cluster_with(Some("SlowCounting"), &["d1", "d2"]);
        let policy = Arc::new(SlowCountingPolicy {
            runs: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let updater = Arc::new(ClusterDestinationsUpdater::new([
            policy.clone() as Arc<dyn AvailableDestinationsPolicy>
        ]));

        // Seed the known destination set without counting it.
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(updater.update_all_destinations(&cluster));
        policy.runs.store(0, Ordering::SeqCst);

        cluster
            .destination("d2")
            .unwrap()
            .health()
            .set_passive(DestinationHealth::Unhealthy);

        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let barrier = barrier.clone();
                let cluster = cluster.clone();
                let updater = updater.clone();
                thread::spawn(move || {
                    barrier.wait();
                    updater.update_available_destinations(&cluster)
                })
            })
            .collect();

        let ran = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ran| *ran)
            .count();

        let runs = policy.runs.load(Ordering::SeqCst);
        assert!(runs >= 1 && runs <= 2, "expected 1..=2 recomputations, got {}", runs);
        assert_eq!(ran, runs);
        assert_eq!(
            ids(&cluster.destinations_state().available_destinations),
            vec!["d1"]
        );
    }

    #[test]
    fn test_queued_update_observes_later_health_change() {
        let cluster = cluster_with(Some("SlowCounting"), &["d1", "d2"]);
        let policy = Arc::new(SlowCountingPolicy {
            runs: AtomicUsize::new(0),
            delay: Duration::from_millis(150),
        });
        let updater = Arc::new(ClusterDestinationsUpdater::new([
            policy.clone() as Arc<dyn AvailableDestinationsPolicy>
        ]));
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(updater.update_all_destinations(&cluster));
        policy.runs.store(0, Ordering::SeqCst);

        // First recomputation starts with both destinations healthy.
        let first = {
            let (cluster, updater) = (cluster.clone(), updater.clone());
            thread::spawn(move || updater.update_available_destinations(&cluster))
        };
        thread::sleep(Duration::from_millis(30));

        // Health changes while it runs; the second caller queues on the lock.
        cluster
            .destination("d1")
            .unwrap()
            .health()
            .set_passive(DestinationHealth::Unhealthy);
        let second = {
            let (cluster, updater) = (cluster.clone(), updater.clone());
            thread::spawn(move || updater.update_available_destinations(&cluster))
        };
        thread::sleep(Duration::from_millis(30));

        // Both permits are taken, so a third caller is debounced.
        assert!(!updater.update_available_destinations(&cluster));

        assert!(first.join().unwrap());
        assert!(second.join().unwrap());
        assert_eq!(policy.runs.load(Ordering::SeqCst), 2);
        assert_eq!(
            ids(&cluster.destinations_state().available_destinations),
            vec!["d2"]
        );
    }
}
