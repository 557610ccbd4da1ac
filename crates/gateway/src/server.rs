//! Gateway control plane wiring.

use crate::config::Config;
use crate::http_server::MetricsServer;
use crate::manager::ProxyConfigManager;
use crate::metrics::MetricsRegistry;
use crate::provider::{FileConfigProvider, ProxyConfigProvider};
use crate::validation::DefaultConfigValidator;
use common::{Error, Result};
use healthcheck::passive::TRANSPORT_FAILURE_RATE;
use healthcheck::{
    ActiveHealthCheckMonitor, ActiveHealthCheckPolicy, ConsecutiveFailuresHealthPolicy,
    DefaultProbingRequestFactory, DestinationHealthUpdater, HealthTransition,
    PassiveHealthCheckPolicy, ProxyOutcome, TransportFailureRateHealthPolicy,
};
use model::{ClusterDestinationsUpdater, ClusterState, DestinationState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Gateway control plane
pub struct GatewayServer {
    config: Config,
    metrics: Option<Arc<MetricsRegistry>>,
    file_provider: Arc<FileConfigProvider>,
    manager: Arc<ProxyConfigManager>,
    monitor: Arc<ActiveHealthCheckMonitor>,
    health_updater: Arc<DestinationHealthUpdater>,
    passive_policies: HashMap<String, Arc<dyn PassiveHealthCheckPolicy>>,
    shutdown: CancellationToken,
}

impl GatewayServer {
    /// Build every component. Must be called within a tokio runtime.
    ///
    /// Fails if the proxy configuration file cannot be loaded.
    pub fn new(config: Config) -> Result<Self> {
        let metrics = if config.metrics.enabled {
            info!("Metrics enabled on {}", config.metrics.listen_addr);
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let destinations_updater = Arc::new(ClusterDestinationsUpdater::new([]));
        let health_updater = Arc::new(DestinationHealthUpdater::new(destinations_updater.clone()));

        let consecutive_failures = Arc::new(ConsecutiveFailuresHealthPolicy::new(health_updater.clone()));
        let transport_failure_rate = Arc::new(TransportFailureRateHealthPolicy::new(
            config.transport_failure_options(),
            health_updater.clone(),
        ));
        let active_policies: Vec<Arc<dyn ActiveHealthCheckPolicy>> = vec![consecutive_failures.clone()];
        let passive_policies: Vec<Arc<dyn PassiveHealthCheckPolicy>> =
            vec![transport_failure_rate.clone()];

        let monitor = Arc::new(ActiveHealthCheckMonitor::new(
            config.monitor_options(),
            active_policies,
            Arc::new(DefaultProbingRequestFactory),
        ));

        let validator = DefaultConfigValidator::new(
            monitor.policy_names(),
            passive_policies.iter().map(|p| p.name().to_string()),
            destinations_updater.policy_names(),
        );

        let file_provider = Arc::new(
            FileConfigProvider::new(&config.proxy.config_path)
                .map_err(|e| Error::Startup(Box::new(e)))?,
        );
        let providers: [Arc<dyn ProxyConfigProvider>; 1] = [file_provider.clone()];

        let mut manager = ProxyConfigManager::new(providers, destinations_updater)
            .with_validator(Arc::new(validator))
            .with_listener(monitor.clone())
            .with_listener(consecutive_failures)
            .with_listener(transport_failure_rate);
        if let Some(metrics) = &metrics {
            manager = manager.with_metrics(metrics.clone());
        }

        Ok(Self {
            config,
            metrics,
            file_provider,
            manager: Arc::new(manager),
            monitor,
            health_updater,
            passive_policies: passive_policies
                .into_iter()
                .map(|p| (p.name().to_ascii_lowercase(), p))
                .collect(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn manager(&self) -> &Arc<ProxyConfigManager> {
        &self.manager
    }

    pub fn health_updater(&self) -> &Arc<DestinationHealthUpdater> {
        &self.health_updater
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Re-read the proxy configuration file.
    ///
    /// On success the manager picks the change up through the provider's
    /// change token.
    pub fn reload_proxy_config(&self) -> Result<()> {
        self.file_provider.reload()
    }

    /// Report the outcome of a proxied request to the cluster's passive
    /// policy. Ignored when passive checks are disabled for the cluster.
    pub fn request_proxied(
        &self,
        cluster: &Arc<ClusterState>,
        destination: &Arc<DestinationState>,
        outcome: ProxyOutcome,
    ) {
        let model = cluster.model();
        let Some(passive) = model.config.passive_health_check() else {
            return;
        };

        let name = passive.policy.as_deref().unwrap_or(TRANSPORT_FAILURE_RATE);
        match self.passive_policies.get(&name.to_ascii_lowercase()) {
            Some(policy) => policy.request_proxied(cluster, destination, outcome),
            None => warn!(
                cluster_id = %cluster.cluster_id(),
                policy = %name,
                "Unknown passive health check policy"
            ),
        }
    }

    /// Load configuration, run the initial health round and serve until
    /// Ctrl-C or [`shutdown_token`](Self::shutdown_token) fires.
    pub async fn run(&self) -> Result<()> {
        info!("Starting gateway control plane");

        self.manager.initial_load().await?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(watch_transitions(
            self.health_updater.subscribe(),
            self.manager.clone(),
            self.metrics.clone(),
            self.shutdown.clone(),
        )));

        if let Some(registry) = &self.metrics {
            let server = MetricsServer::new(registry.clone(), self.config.metrics.listen_addr.clone());
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run(shutdown).await {
                    warn!(error = %e, "Metrics server error");
                }
            }));
        }

        tasks.push(tokio::spawn(reload_on_hangup(
            self.file_provider.clone(),
            self.shutdown.clone(),
        )));

        self.monitor.check_health(self.manager.clusters()).await;
        info!(
            clusters = self.manager.clusters().len(),
            endpoints = self.manager.endpoints().len(),
            "Initial health checks completed, gateway running"
        );

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Ctrl-C received, shutting down");
            }
        }

        self.shutdown.cancel();
        self.manager.dispose();
        self.monitor.dispose();
        self.health_updater.dispose();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        info!("Gateway control plane stopped");
        Ok(())
    }
}

/// Feed health transitions into the metrics registry
async fn watch_transitions(
    mut transitions: broadcast::Receiver<HealthTransition>,
    manager: Arc<ProxyConfigManager>,
    metrics: Option<Arc<MetricsRegistry>>,
    shutdown: CancellationToken,
) {
    loop {
        let transition = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = transitions.recv() => received,
        };

        match transition {
            Ok(transition) => {
                let Some(metrics) = &metrics else {
                    continue;
                };
                metrics.record_transition(&transition);
                if let Some(cluster) = manager.cluster(&transition.cluster_id) {
                    metrics.update_available_destinations(
                        cluster.cluster_id(),
                        cluster.destinations_state().available_destinations.len(),
                    );
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Health transition stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    debug!("Health transition watcher stopped");
}

#[cfg(unix)]
async fn reload_on_hangup(provider: Arc<FileConfigProvider>, shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, file reloads disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!(path = %provider.path().display(), "SIGHUP received, reloading proxy configuration");
                // A bad file is logged by the provider and leaves the current snapshot.
                let _ = provider.reload();
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_provider: Arc<FileConfigProvider>, shutdown: CancellationToken) {
    shutdown.cancelled().await;
}
