//! Applies health verdicts to destinations.
//!
//! Active verdicts are applied in batches with a single recomputation per
//! cluster. Passive verdicts may be temporary: an unhealthy passive verdict
//! schedules a reactivation that resets the destination to `Unknown` after
//! the reactivation period, letting traffic probe it again.

use crate::scheduler::{EntityActionScheduler, SchedulerMode};
use crate::types::{HealthCheckKind, HealthTransition, NewActiveDestinationHealth};
use model::{ClusterDestinationsUpdater, ClusterState, DestinationHealth, DestinationState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const TRANSITION_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, PartialEq, Eq, Hash)]
struct ReactivationKey {
    cluster: Arc<ClusterState>,
    destination: Arc<DestinationState>,
}

/// Writes health verdicts and triggers destination recomputation.
pub struct DestinationHealthUpdater {
    destinations_updater: Arc<ClusterDestinationsUpdater>,
    reactivations: EntityActionScheduler<ReactivationKey>,
    transitions: broadcast::Sender<HealthTransition>,
}

impl DestinationHealthUpdater {
    /// Must be called within a tokio runtime.
    pub fn new(destinations_updater: Arc<ClusterDestinationsUpdater>) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);

        let reactivations = {
            let destinations_updater = destinations_updater.clone();
            let transitions = transitions.clone();
            EntityActionScheduler::new(SchedulerMode::RunOnce, move |key: ReactivationKey| {
                let destinations_updater = destinations_updater.clone();
                let transitions = transitions.clone();
                async move {
                    reactivate(&key, &destinations_updater, &transitions);
                    Ok(())
                }
            })
        };
        reactivations.start();

        Self {
            destinations_updater,
            reactivations,
            transitions,
        }
    }

    /// Receive every health transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.transitions.subscribe()
    }

    /// Apply a batch of active verdicts for one cluster.
    ///
    /// Recomputes available destinations once if any verdict changed.
    pub fn set_active(&self, cluster: &Arc<ClusterState>, new_health: &[NewActiveDestinationHealth]) {
        let mut changed = false;

        for item in new_health {
            let health = item.destination.health();
            let previous = health.active();
            if previous == item.health {
                continue;
            }

            health.set_active(item.health);
            changed = true;
            publish(
                &self.transitions,
                cluster,
                &item.destination,
                HealthCheckKind::Active,
                previous,
                item.health,
            );
        }

        if changed {
            self.destinations_updater.update_available_destinations(cluster);
        }
    }

    /// Apply a passive verdict for one destination.
    ///
    /// An unhealthy verdict is reverted to `Unknown` after
    /// `reactivation_period`. Recomputation runs asynchronously.
    pub fn set_passive(
        &self,
        cluster: &Arc<ClusterState>,
        destination: &Arc<DestinationState>,
        new_health: DestinationHealth,
        reactivation_period: Duration,
    ) {
        let previous = destination.health().passive();
        if previous == new_health {
            return;
        }

        destination.health().set_passive(new_health);
        publish(
            &self.transitions,
            cluster,
            destination,
            HealthCheckKind::Passive,
            previous,
            new_health,
        );

        if new_health == DestinationHealth::Unhealthy {
            self.reactivations.schedule(
                ReactivationKey {
                    cluster: cluster.clone(),
                    destination: destination.clone(),
                },
                reactivation_period,
            );
        }

        let cluster = cluster.clone();
        let destinations_updater = self.destinations_updater.clone();
        tokio::spawn(async move {
            destinations_updater.update_available_destinations(&cluster);
        });
    }

    /// Cancel pending reactivations.
    pub fn dispose(&self) {
        self.reactivations.dispose();
    }
}

fn reactivate(
    key: &ReactivationKey,
    destinations_updater: &ClusterDestinationsUpdater,
    transitions: &broadcast::Sender<HealthTransition>,
) {
    let health = key.destination.health();
    if health.passive() != DestinationHealth::Unhealthy {
        return;
    }

    health.set_passive(DestinationHealth::Unknown);
    info!(
        cluster_id = %key.cluster.cluster_id(),
        destination_id = %key.destination.destination_id(),
        "Passive health reactivated"
    );
    publish(
        transitions,
        &key.cluster,
        &key.destination,
        HealthCheckKind::Passive,
        DestinationHealth::Unhealthy,
        DestinationHealth::Unknown,
    );

    destinations_updater.update_available_destinations(&key.cluster);
}

fn publish(
    transitions: &broadcast::Sender<HealthTransition>,
    cluster: &ClusterState,
    destination: &DestinationState,
    kind: HealthCheckKind,
    from: DestinationHealth,
    to: DestinationHealth,
) {
    match to {
        DestinationHealth::Unhealthy => warn!(
            cluster_id = %cluster.cluster_id(),
            destination_id = %destination.destination_id(),
            %kind,
            %from,
            "Destination is now UNHEALTHY"
        ),
        _ => info!(
            cluster_id = %cluster.cluster_id(),
            destination_id = %destination.destination_id(),
            %kind,
            %from,
            %to,
            "Destination health changed"
        ),
    }

    // No subscribers is fine.
    let _ = transitions.send(HealthTransition {
        cluster_id: cluster.cluster_id().to_string(),
        destination_id: destination.destination_id().to_string(),
        kind,
        from,
        to,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        ClusterConfig, ClusterModel, DestinationConfig, DestinationModel, HealthCheckConfig,
        PassiveHealthCheckConfig, id_key,
    };
    use tokio::time::sleep;

    fn passive_cluster(destination_ids: &[&str]) -> Arc<ClusterState> {
        let config = ClusterConfig {
            cluster_id: "c1".to_string(),
            health_check: Some(HealthCheckConfig {
                passive: Some(PassiveHealthCheckConfig {
                    enabled: true,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cluster = Arc::new(ClusterState::new(
            "c1",
            ClusterModel::new(config, reqwest::Client::new()),
        ));
        for id in destination_ids {
            let destination = DestinationState::new(
                *id,
                DestinationModel::new(DestinationConfig {
                    address: format!("http://{}.internal/", id),
                    ..Default::default()
                }),
            );
            cluster.destinations().insert(id_key(id), Arc::new(destination));
        }
        cluster
    }

    fn available_ids(cluster: &ClusterState) -> Vec<String> {
        cluster
            .destinations_state()
            .available_destinations
            .iter()
            .map(|d| d.destination_id().to_string())
            .collect()
    }

    async fn setup(ids: &[&str]) -> (DestinationHealthUpdater, Arc<ClusterState>) {
        let destinations = Arc::new(ClusterDestinationsUpdater::new([]));
        let cluster = passive_cluster(ids);
        destinations.update_all_destinations(&cluster).await;
        (DestinationHealthUpdater::new(destinations), cluster)
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_unhealthy_is_reactivated() {
        let (updater, cluster) = setup(&["d1", "d2"]).await;
        let d1 = cluster.destination("d1").unwrap();

        updater.set_passive(&cluster, &d1, DestinationHealth::Unhealthy, Duration::from_secs(5));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(d1.health().passive(), DestinationHealth::Unhealthy);
        assert_eq!(available_ids(&cluster), vec!["d2"]);

        sleep(Duration::from_secs(6)).await;

        assert_eq!(d1.health().passive(), DestinationHealth::Unknown);
        assert_eq!(available_ids(&cluster), vec!["d1", "d2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_skips_destination_marked_healthy() {
        let (updater, cluster) = setup(&["d1"]).await;
        let d1 = cluster.destination("d1").unwrap();

        updater.set_passive(&cluster, &d1, DestinationHealth::Unhealthy, Duration::from_secs(5));
        sleep(Duration::from_secs(1)).await;
        updater.set_passive(&cluster, &d1, DestinationHealth::Healthy, Duration::from_secs(5));
        sleep(Duration::from_secs(10)).await;

        assert_eq!(d1.health().passive(), DestinationHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_passive_verdict_is_ignored() {
        let (updater, cluster) = setup(&["d1"]).await;
        let d1 = cluster.destination("d1").unwrap();
        let mut transitions = updater.subscribe();

        updater.set_passive(&cluster, &d1, DestinationHealth::Unknown, Duration::from_secs(5));
        sleep(Duration::from_secs(10)).await;

        assert!(transitions.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_alternating_passive_verdicts_keep_the_last_one() {
        let (updater, cluster) = setup(&["d1", "d2"]).await;
        let d1 = cluster.destination("d1").unwrap();

        for round in 0..=100 {
            let health = if round % 2 == 0 {
                DestinationHealth::Unhealthy
            } else {
                DestinationHealth::Healthy
            };
            updater.set_passive(&cluster, &d1, health, Duration::from_secs(60));
            assert_eq!(d1.health().passive(), health);
        }

        // Overlapping recomputations are coalesced; the last one sees the final verdict.
        for _ in 0..100 {
            if available_ids(&cluster) == vec!["d2"] {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(d1.health().passive(), DestinationHealth::Unhealthy);
        assert_eq!(available_ids(&cluster), vec!["d2"]);

        updater.set_passive(&cluster, &d1, DestinationHealth::Healthy, Duration::from_secs(60));
        for _ in 0..100 {
            if available_ids(&cluster).len() == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(d1.health().passive(), DestinationHealth::Healthy);
        assert_eq!(available_ids(&cluster), vec!["d1", "d2"]);

        updater.dispose();
    }

    #[tokio::test]
    async fn test_set_active_publishes_transitions() {
        let (updater, cluster) = setup(&["d1", "d2"]).await;
        let d1 = cluster.destination("d1").unwrap();
        let d2 = cluster.destination("d2").unwrap();
        d2.health().set_active(DestinationHealth::Healthy);
        let mut transitions = updater.subscribe();

        updater.set_active(
            &cluster,
            &[
                NewActiveDestinationHealth::new(d1.clone(), DestinationHealth::Unhealthy),
                NewActiveDestinationHealth::new(d2.clone(), DestinationHealth::Healthy),
            ],
        );

        // Active checks are disabled on this cluster, so everything stays available.
        assert_eq!(available_ids(&cluster), vec!["d1", "d2"]);
        assert_eq!(d1.health().active(), DestinationHealth::Unhealthy);

        let transition = transitions.try_recv().unwrap();
        assert_eq!(transition.destination_id, "d1");
        assert_eq!(transition.kind, HealthCheckKind::Active);
        assert_eq!(transition.from, DestinationHealth::Unknown);
        assert_eq!(transition.to, DestinationHealth::Unhealthy);
        assert!(transitions.try_recv().is_err());
    }
}
