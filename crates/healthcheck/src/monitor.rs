//! Active health check monitoring and management.

use crate::policy::{ActiveHealthCheckPolicy, CONSECUTIVE_FAILURES};
use crate::probing::{ProbingRequestFactory, probe_destination};
use crate::scheduler::{EntityActionScheduler, SchedulerMode};
use crate::types::MonitorOptions;
use futures::future::join_all;
use model::{ClusterChangeListener, ClusterState};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

/// Probes every cluster with active health checks enabled, on the
/// cluster's own interval, and hands the results to the cluster's policy.
pub struct ActiveHealthCheckMonitor {
    prober: Arc<ClusterProber>,
    scheduler: EntityActionScheduler<Arc<ClusterState>>,
    options: MonitorOptions,
    initial_probe_completed: AtomicBool,
}

impl ActiveHealthCheckMonitor {
    /// Create a monitor. Must be called within a tokio runtime.
    ///
    /// Periodic probing does not begin until [`check_health`](Self::check_health)
    /// completes; clusters registered before that are queued.
    pub fn new(
        options: MonitorOptions,
        policies: impl IntoIterator<Item = Arc<dyn ActiveHealthCheckPolicy>>,
        request_factory: Arc<dyn ProbingRequestFactory>,
    ) -> Self {
        let policies = policies
            .into_iter()
            .map(|policy| (policy.name().to_ascii_lowercase(), policy))
            .collect();

        let prober = Arc::new(ClusterProber {
            policies,
            request_factory,
            default_timeout: options.default_timeout,
        });

        let scheduler = {
            let prober = prober.clone();
            EntityActionScheduler::new(SchedulerMode::Repeating, move |cluster: Arc<ClusterState>| {
                let prober = prober.clone();
                async move {
                    prober.probe_cluster(&cluster).await;
                    Ok(())
                }
            })
        };

        Self {
            prober,
            scheduler,
            options,
            initial_probe_completed: AtomicBool::new(false),
        }
    }

    /// Whether the initial probing round has finished.
    pub fn initial_probe_completed(&self) -> bool {
        self.initial_probe_completed.load(Ordering::Acquire)
    }

    /// Names of the registered active policies.
    pub fn policy_names(&self) -> Vec<String> {
        self.prober
            .policies
            .values()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Probe all given clusters once, in parallel, then start periodic probing.
    ///
    /// Failures of individual probes or policies are logged and never abort
    /// the round.
    pub async fn check_health(&self, clusters: impl IntoIterator<Item = Arc<ClusterState>>) {
        let probes: Vec<_> = clusters
            .into_iter()
            .filter(|cluster| cluster.model().config.active_health_check().is_some())
            .map(|cluster| {
                let prober = self.prober.clone();
                tokio::spawn(async move { prober.probe_cluster(&cluster).await })
            })
            .collect();

        let count = probes.len();
        for result in join_all(probes).await {
            if let Err(e) = result {
                error!(error = %e, "Initial probing task failed");
            }
        }

        self.initial_probe_completed.store(true, Ordering::Release);
        info!(clusters = count, "Initial active health probing completed");

        self.scheduler.start();
    }

    /// Whether `cluster` is registered for periodic probing.
    pub async fn is_monitoring(&self, cluster: &Arc<ClusterState>) -> bool {
        self.scheduler.is_scheduled(cluster).await
    }

    /// Stop periodic probing.
    pub fn dispose(&self) {
        info!("Active health check monitor stopping");
        self.scheduler.dispose();
    }

    fn interval(&self, cluster: &ClusterState) -> Option<Duration> {
        let model = cluster.model();
        model
            .config
            .active_health_check()
            .map(|active| active.interval.unwrap_or(self.options.default_interval))
    }
}

impl ClusterChangeListener for ActiveHealthCheckMonitor {
    fn on_cluster_added(&self, cluster: &Arc<ClusterState>) {
        if let Some(interval) = self.interval(cluster) {
            debug!(cluster_id = %cluster.cluster_id(), ?interval, "Scheduling active probing");
            self.scheduler.schedule(cluster.clone(), interval);
        }
    }

    fn on_cluster_changed(&self, cluster: &Arc<ClusterState>) {
        match self.interval(cluster) {
            Some(interval) => self.scheduler.change_period(cluster.clone(), interval),
            None => self.scheduler.unschedule(cluster),
        }
    }

    fn on_cluster_removed(&self, cluster: &Arc<ClusterState>) {
        self.scheduler.unschedule(cluster);
    }
}

/// Probing state shared between the monitor and its scheduler callback.
struct ClusterProber {
    policies: HashMap<String, Arc<dyn ActiveHealthCheckPolicy>>,
    request_factory: Arc<dyn ProbingRequestFactory>,
    default_timeout: Duration,
}

impl ClusterProber {
    async fn probe_cluster(&self, cluster: &Arc<ClusterState>) {
        let model = cluster.model();
        let Some(active) = model.config.active_health_check() else {
            return;
        };

        let policy_name = active.policy.as_deref().unwrap_or(CONSECUTIVE_FAILURES);
        let Some(policy) = self.policies.get(&policy_name.to_ascii_lowercase()) else {
            error!(
                cluster_id = %cluster.cluster_id(),
                policy = %policy_name,
                "Unknown active health check policy"
            );
            return;
        };

        let destinations = cluster.destinations_state().all_destinations.clone();
        if destinations.is_empty() {
            return;
        }

        let timeout = active.timeout.unwrap_or(self.default_timeout);
        debug!(
            cluster_id = %cluster.cluster_id(),
            destinations = destinations.len(),
            "Probing destinations"
        );

        let results = join_all(destinations.into_iter().map(|destination| {
            probe_destination(self.request_factory.as_ref(), &model, destination, timeout)
        }))
        .await;

        let outcome = catch_unwind(AssertUnwindSafe(|| policy.probing_completed(cluster, &results)));
        if outcome.is_err() {
            error!(
                cluster_id = %cluster.cluster_id(),
                policy = %policy.name(),
                "Active health check policy panicked"
            );
        }
    }
}
