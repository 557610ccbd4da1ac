//! Reconciliation of provider snapshots into runtime state.
//!
//! The manager owns the runtime cluster and route tables. Each reload fetches
//! a snapshot from every provider whose change token fired, runs filters and
//! validation over it, and applies the union of the last valid snapshot of
//! every provider. Applying diffs the incoming configuration against the
//! runtime tables, updates state in place, notifies cluster listeners and
//! publishes a new [`EndpointSnapshot`] when any route changed.

use crate::endpoints::EndpointSnapshot;
use crate::filter::ProxyConfigFilter;
use crate::metrics::MetricsRegistry;
use crate::provider::{ProxyConfigProvider, ProxyConfigSnapshot};
use crate::validation::{ConfigValidator, DefaultConfigValidator};
use arc_swap::ArcSwap;
use common::{Error, Result};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::select_all;
use model::{
    ClusterChange, ClusterChangeListener, ClusterConfig, ClusterDestinationsUpdater, ClusterModel,
    ClusterState, DestinationConfig, DestinationModel, DestinationState, RouteConfig, RouteModel,
    RouteState, build_http_client, id_key, notify_listeners,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Last accepted configuration of one provider
#[derive(Debug, Clone, Default)]
struct ValidConfig {
    routes: Vec<RouteConfig>,
    clusters: Vec<ClusterConfig>,
}

struct ProviderState {
    provider: Arc<dyn ProxyConfigProvider>,
    latest: Option<ValidConfig>,
    /// Token of the last fetched snapshot; `None` until a fetch succeeds and
    /// after a fetch fails
    change_token: Option<CancellationToken>,
}

impl ProviderState {
    fn needs_fetch(&self) -> bool {
        self.change_token.as_ref().is_none_or(|t| t.is_cancelled())
    }
}

/// Outcome of applying a merged configuration
#[derive(Debug, Default, Clone, Copy)]
struct ApplySummary {
    clusters_added: usize,
    clusters_changed: usize,
    clusters_removed: usize,
    routes_changed: usize,
    endpoints_published: bool,
}

/// Reconciles provider snapshots into runtime clusters and routes
pub struct ProxyConfigManager {
    providers: Mutex<Vec<ProviderState>>,
    filters: Vec<Arc<dyn ProxyConfigFilter>>,
    validator: Arc<dyn ConfigValidator>,
    listeners: Vec<Arc<dyn ClusterChangeListener>>,
    destinations_updater: Arc<ClusterDestinationsUpdater>,
    metrics: Option<Arc<MetricsRegistry>>,

    clusters: DashMap<String, Arc<ClusterState>>,
    routes: DashMap<String, Arc<RouteState>>,
    endpoints: ArcSwap<EndpointSnapshot>,

    /// Fires when provider change tokens were replaced or cleared
    watch_set: ArcSwap<CancellationToken>,
    shutdown: CancellationToken,
}

impl ProxyConfigManager {
    pub fn new(
        providers: impl IntoIterator<Item = Arc<dyn ProxyConfigProvider>>,
        destinations_updater: Arc<ClusterDestinationsUpdater>,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|provider| ProviderState {
                provider,
                latest: None,
                change_token: None,
            })
            .collect();

        Self {
            providers: Mutex::new(providers),
            filters: Vec::new(),
            validator: Arc::new(DefaultConfigValidator::default()),
            listeners: Vec::new(),
            destinations_updater,
            metrics: None,
            clusters: DashMap::new(),
            routes: DashMap::new(),
            endpoints: ArcSwap::from_pointee(EndpointSnapshot::default()),
            watch_set: ArcSwap::from_pointee(CancellationToken::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Append a filter. Filters run in the order they were added.
    pub fn with_filter(mut self, filter: Arc<dyn ProxyConfigFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ConfigValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ClusterChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Load every provider and apply the result, then start watching the
    /// providers' change tokens.
    ///
    /// Any failure here is fatal and reported as [`Error::Startup`].
    pub async fn initial_load(self: &Arc<Self>) -> Result<()> {
        let started = Instant::now();
        let result = {
            let mut providers = self.providers.lock().await;
            self.update(&mut providers, true, true).await
        };
        self.record_reload(result.is_ok(), started);

        if let Err(e) = result {
            error!(error = %e, "Initial proxy configuration load failed");
            return Err(Error::Startup(Box::new(e)));
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.watch_changes().await;
        });

        info!(
            clusters = self.clusters.len(),
            routes = self.routes.len(),
            "Initial proxy configuration loaded"
        );
        Ok(())
    }

    /// Re-fetch every provider and apply the result.
    ///
    /// A provider whose snapshot fails to load or validate keeps its previous
    /// configuration; the error is still returned.
    pub async fn reload(&self) -> Result<()> {
        self.refresh(true).await
    }

    async fn refresh(&self, force: bool) -> Result<()> {
        let started = Instant::now();
        let result = {
            let mut providers = self.providers.lock().await;
            self.update(&mut providers, false, force).await
        };
        self.record_reload(result.is_ok(), started);

        if let Err(e) = &result {
            error!(error = %e, "Proxy configuration reload failed, keeping previous configuration");
        }
        result
    }

    /// Stop watching providers.
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }

    /// Current endpoint snapshot
    pub fn endpoints(&self) -> Arc<EndpointSnapshot> {
        self.endpoints.load_full()
    }

    pub fn cluster(&self, cluster_id: &str) -> Option<Arc<ClusterState>> {
        self.clusters
            .get(&id_key(cluster_id))
            .map(|entry| entry.value().clone())
    }

    pub fn clusters(&self) -> Vec<Arc<ClusterState>> {
        self.clusters.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn route(&self, route_id: &str) -> Option<Arc<RouteState>> {
        self.routes
            .get(&id_key(route_id))
            .map(|entry| entry.value().clone())
    }

    pub fn routes(&self) -> Vec<Arc<RouteState>> {
        self.routes.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn watch_changes(self: Arc<Self>) {
        debug!("Watching proxy configuration providers for changes");

        loop {
            // Read under the provider lock so an update cannot slip in between.
            let (tokens, watch_set) = {
                let providers = self.providers.lock().await;
                let tokens: Vec<CancellationToken> = providers
                    .iter()
                    .filter_map(|p| p.change_token.clone())
                    .collect();
                (tokens, self.watch_set.load_full())
            };

            let changed = async move {
                if tokens.is_empty() {
                    std::future::pending::<()>().await;
                } else {
                    select_all(tokens.into_iter().map(|t| Box::pin(t.cancelled_owned()))).await;
                }
            };
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = watch_set.cancelled() => {
                    debug!("Provider change tokens replaced, rewatching");
                    continue;
                }
                _ = changed => {}
            }

            info!("Proxy configuration changed, reloading");
            // Failures are logged by refresh; the previous configuration stays.
            let _ = self.refresh(false).await;
        }

        debug!("Stopped watching proxy configuration providers");
    }

    /// Fetch providers (all of them when `force`, otherwise those whose token
    /// fired), then merge and apply.
    async fn update(&self, providers: &mut [ProviderState], initial: bool, force: bool) -> Result<()> {
        let mut failed = Vec::new();

        for state in providers.iter_mut().filter(|p| force || p.needs_fetch()) {
            let name = state.provider.name().to_string();
            let snapshot = match state.provider.get_config() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!(provider = %name, error = %e, "Failed to fetch proxy configuration");
                    // Not watched again until an explicit reload fetches it successfully.
                    state.change_token = None;
                    failed.push(Error::provider(format!("{}: {}", name, e)));
                    continue;
                }
            };
            state.change_token = Some(snapshot.change_token.clone());

            match self.prepare(&snapshot).await {
                Ok(valid) => {
                    debug!(
                        provider = %name,
                        routes = valid.routes.len(),
                        clusters = valid.clusters.len(),
                        "Accepted proxy configuration"
                    );
                    state.latest = Some(valid);
                }
                Err(e) => {
                    error!(provider = %name, error = %e, "Rejected proxy configuration");
                    failed.push(e);
                }
            }
        }
        self.rewatch();

        if initial && !failed.is_empty() {
            return Err(flatten(failed));
        }

        let (routes, clusters) = merge(providers)?;
        let summary = self.apply(routes, clusters).await;
        info!(
            clusters_added = summary.clusters_added,
            clusters_changed = summary.clusters_changed,
            clusters_removed = summary.clusters_removed,
            routes_changed = summary.routes_changed,
            published = summary.endpoints_published,
            "Applied proxy configuration"
        );

        if failed.is_empty() {
            Ok(())
        } else {
            Err(flatten(failed))
        }
    }

    /// Run filters and validation over one snapshot.
    async fn prepare(&self, snapshot: &ProxyConfigSnapshot) -> Result<ValidConfig> {
        let mut errors = Vec::new();
        let mut clusters = Vec::with_capacity(snapshot.clusters.len());
        let mut cluster_keys = HashSet::new();

        for cluster in &snapshot.clusters {
            if !cluster_keys.insert(id_key(&cluster.cluster_id)) {
                errors.push(Error::config(format!(
                    "duplicate cluster id '{}'",
                    cluster.cluster_id
                )));
                continue;
            }

            let cluster = match self.filter_cluster(cluster.clone()).await {
                Ok(cluster) => cluster,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            errors.extend(self.validate_cluster(&cluster).await);
            clusters.push(cluster);
        }

        let by_id: HashMap<String, &ClusterConfig> = clusters
            .iter()
            .map(|c| (id_key(&c.cluster_id), c))
            .collect();

        let mut routes = Vec::with_capacity(snapshot.routes.len());
        let mut route_keys = HashSet::new();
        for route in &snapshot.routes {
            if !route_keys.insert(id_key(&route.route_id)) {
                errors.push(Error::config(format!("duplicate route id '{}'", route.route_id)));
                continue;
            }

            let cluster = route
                .cluster_id
                .as_deref()
                .and_then(|id| by_id.get(&id_key(id)).copied());
            let route = match self.filter_route(route.clone(), cluster).await {
                Ok(route) => route,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            errors.extend(self.validate_route(&route).await);
            routes.push(route);
        }

        if errors.is_empty() {
            Ok(ValidConfig { routes, clusters })
        } else {
            Err(Error::InvalidConfig(errors))
        }
    }

    async fn filter_cluster(&self, mut cluster: ClusterConfig) -> Result<ClusterConfig> {
        for filter in &self.filters {
            let id = cluster.cluster_id.clone();
            cluster = AssertUnwindSafe(filter.configure_cluster(cluster))
                .catch_unwind()
                .await
                .map_err(|_| Error::config(format!("cluster '{}': filter panicked", id)))?
                .map_err(|e| Error::config(format!("cluster '{}': {}", id, e)))?;
        }
        Ok(cluster)
    }

    async fn filter_route(
        &self,
        mut route: RouteConfig,
        cluster: Option<&ClusterConfig>,
    ) -> Result<RouteConfig> {
        for filter in &self.filters {
            let id = route.route_id.clone();
            route = AssertUnwindSafe(filter.configure_route(route, cluster))
                .catch_unwind()
                .await
                .map_err(|_| Error::config(format!("route '{}': filter panicked", id)))?
                .map_err(|e| Error::config(format!("route '{}': {}", id, e)))?;
        }
        Ok(route)
    }

    async fn validate_cluster(&self, cluster: &ClusterConfig) -> Vec<Error> {
        AssertUnwindSafe(self.validator.validate_cluster(cluster))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                vec![Error::config(format!(
                    "cluster '{}': validator panicked",
                    cluster.cluster_id
                ))]
            })
    }

    async fn validate_route(&self, route: &RouteConfig) -> Vec<Error> {
        AssertUnwindSafe(self.validator.validate_route(route))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                vec![Error::config(format!(
                    "route '{}': validator panicked",
                    route.route_id
                ))]
            })
    }

    /// Diff `routes` and `clusters` against the runtime tables and apply.
    async fn apply(&self, routes: Vec<RouteConfig>, clusters: Vec<ClusterConfig>) -> ApplySummary {
        let mut summary = ApplySummary::default();

        self.apply_clusters(clusters, &mut summary).await;
        summary.routes_changed = self.apply_routes(routes);

        if summary.routes_changed > 0 {
            self.publish_endpoints();
            summary.endpoints_published = true;
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_counts(self.clusters.len(), self.routes.len());
            for cluster in self.clusters.iter() {
                metrics.update_available_destinations(
                    cluster.cluster_id(),
                    cluster.destinations_state().available_destinations.len(),
                );
            }
        }

        summary
    }

    async fn apply_clusters(&self, incoming: Vec<ClusterConfig>, summary: &mut ApplySummary) {
        let mut desired = HashSet::with_capacity(incoming.len());

        for config in incoming {
            let key = id_key(&config.cluster_id);
            desired.insert(key.clone());

            match self.clusters.get(&key).map(|entry| entry.value().clone()) {
                Some(cluster) => {
                    if self.update_cluster(&cluster, config).await {
                        summary.clusters_changed += 1;
                        self.notify(&cluster, ClusterChange::Changed);
                    }
                }
                None => {
                    let client = match build_http_client(config.http_client.as_ref()) {
                        Ok(client) => client,
                        Err(e) => {
                            error!(cluster_id = %config.cluster_id, error = %e, "Skipping cluster");
                            continue;
                        }
                    };

                    info!(cluster_id = %config.cluster_id, "Adding cluster");
                    let destinations = config.destinations.clone();
                    let cluster = Arc::new(ClusterState::new(
                        config.cluster_id.clone(),
                        ClusterModel::new(config, client),
                    ));
                    update_destinations(&cluster, &destinations);
                    self.destinations_updater.update_all_destinations(&cluster).await;

                    self.clusters.insert(key, cluster.clone());
                    summary.clusters_added += 1;
                    self.notify(&cluster, ClusterChange::Added);
                }
            }
        }

        let removed: Vec<String> = self
            .clusters
            .iter()
            .filter(|entry| !desired.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for key in removed {
            if let Some((_, cluster)) = self.clusters.remove(&key) {
                info!(cluster_id = %cluster.cluster_id(), "Removing cluster");
                summary.clusters_removed += 1;
                self.notify(&cluster, ClusterChange::Removed);
            }
        }
    }

    /// Update an existing cluster in place. Returns whether anything changed.
    async fn update_cluster(&self, cluster: &Arc<ClusterState>, config: ClusterConfig) -> bool {
        let destinations_changed = update_destinations(cluster, &config.destinations);
        let current = cluster.model();
        let config_changed = current.has_config_changed(&config);

        if config_changed {
            let client = if current.config.http_client == config.http_client {
                current.http_client.clone()
            } else {
                match build_http_client(config.http_client.as_ref()) {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(
                            cluster_id = %config.cluster_id,
                            error = %e,
                            "Keeping previous HTTP client"
                        );
                        current.http_client.clone()
                    }
                }
            };
            let revision = cluster.replace_model(ClusterModel::new(config, client));
            info!(cluster_id = %cluster.cluster_id(), revision, "Updated cluster");
        } else if destinations_changed {
            cluster.refresh_model(ClusterModel::new(config, current.http_client.clone()));
            debug!(cluster_id = %cluster.cluster_id(), "Updated cluster destinations");
        }

        if !(config_changed || destinations_changed) {
            return false;
        }

        self.destinations_updater.update_all_destinations(cluster).await;
        true
    }

    /// Returns the number of routes added, rebuilt or removed.
    fn apply_routes(&self, incoming: Vec<RouteConfig>) -> usize {
        let mut changed = 0;
        let mut desired = HashSet::with_capacity(incoming.len());

        for config in incoming {
            let key = id_key(&config.route_id);
            desired.insert(key.clone());

            let cluster = config
                .cluster_id
                .as_deref()
                .and_then(|id| self.cluster(id));

            match self.routes.get(&key).map(|entry| entry.value().clone()) {
                Some(route) => {
                    if route.needs_update(&config, cluster.as_ref()) {
                        debug!(route_id = %config.route_id, "Updating route");
                        route.update(RouteModel::new(config, cluster));
                        changed += 1;
                    }
                }
                None => {
                    debug!(route_id = %config.route_id, "Adding route");
                    let route_id = config.route_id.clone();
                    let route = RouteState::new(route_id, RouteModel::new(config, cluster));
                    self.routes.insert(key, Arc::new(route));
                    changed += 1;
                }
            }
        }

        let before = self.routes.len();
        self.routes.retain(|key, route| {
            let keep = desired.contains(key);
            if !keep {
                debug!(route_id = %route.route_id(), "Removing route");
            }
            keep
        });
        changed + (before - self.routes.len())
    }

    /// Swap in a fresh endpoint snapshot, then fire the previous token.
    fn publish_endpoints(&self) {
        let endpoints = self.routes.iter().map(|entry| entry.value().endpoint()).collect();
        let snapshot = Arc::new(EndpointSnapshot::new(endpoints));
        let count = snapshot.len();

        let previous = self.endpoints.swap(snapshot);
        previous.change_token().cancel();

        if let Some(metrics) = &self.metrics {
            metrics.record_endpoint_publish();
        }
        info!(endpoints = count, "Published route endpoints");
    }

    /// Wake the watcher so it picks up the current provider tokens.
    fn rewatch(&self) {
        let previous = self.watch_set.swap(Arc::new(CancellationToken::new()));
        previous.cancel();
    }

    fn notify(&self, cluster: &Arc<ClusterState>, change: ClusterChange) {
        notify_listeners(&self.listeners, cluster, change);
        if let Some(metrics) = &self.metrics {
            metrics.record_cluster_change(cluster.cluster_id(), change);
        }
    }

    fn record_reload(&self, success: bool, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_reload(success, started.elapsed());
        }
    }
}

/// Sync a cluster's destination table with `incoming`. Returns whether any
/// destination was added, changed or removed.
fn update_destinations(
    cluster: &ClusterState,
    incoming: &BTreeMap<String, DestinationConfig>,
) -> bool {
    let mut changed = false;
    let mut desired = HashSet::with_capacity(incoming.len());

    for (id, config) in incoming {
        let key = id_key(id);
        desired.insert(key.clone());

        match cluster.destination(id) {
            Some(destination) => {
                if destination.model().has_changed(config) {
                    destination.set_model(DestinationModel::new(config.clone()));
                    changed = true;
                }
            }
            None => {
                let destination = DestinationState::new(id.clone(), DestinationModel::new(config.clone()));
                cluster.destinations().insert(key, Arc::new(destination));
                changed = true;
            }
        }
    }

    let before = cluster.destinations().len();
    cluster.destinations().retain(|key, _| desired.contains(key));
    changed || cluster.destinations().len() != before
}

/// Union of the last valid configuration of every provider.
///
/// An id claimed by two providers aborts the apply.
fn merge(providers: &[ProviderState]) -> Result<(Vec<RouteConfig>, Vec<ClusterConfig>)> {
    let mut routes = Vec::new();
    let mut clusters = Vec::new();
    let mut route_owners: HashMap<String, &str> = HashMap::new();
    let mut cluster_owners: HashMap<String, &str> = HashMap::new();
    let mut errors = Vec::new();

    for state in providers {
        let Some(latest) = &state.latest else {
            continue;
        };
        let name = state.provider.name();

        for cluster in &latest.clusters {
            if let Some(owner) = cluster_owners.insert(id_key(&cluster.cluster_id), name) {
                errors.push(Error::config(format!(
                    "cluster '{}' is defined by both '{}' and '{}'",
                    cluster.cluster_id, owner, name
                )));
            }
            clusters.push(cluster.clone());
        }

        for route in &latest.routes {
            if let Some(owner) = route_owners.insert(id_key(&route.route_id), name) {
                errors.push(Error::config(format!(
                    "route '{}' is defined by both '{}' and '{}'",
                    route.route_id, owner, name
                )));
            }
            routes.push(route.clone());
        }
    }

    if errors.is_empty() {
        Ok((routes, clusters))
    } else {
        Err(Error::InvalidConfig(errors))
    }
}

fn flatten(mut errors: Vec<Error>) -> Error {
    if errors.len() == 1 {
        errors.remove(0)
    } else {
        Error::InvalidConfig(errors)
    }
}
