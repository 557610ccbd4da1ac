//! Prometheus metrics for the gateway control plane.

use healthcheck::HealthTransition;
use model::{ClusterChange, DestinationHealth};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for reload metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReloadLabels {
    /// Outcome (success, failure)
    pub outcome: String,
}

/// Labels for cluster change metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterChangeLabels {
    /// Change kind (added, changed, removed)
    pub change: String,
}

/// Labels for health transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    /// Cluster ID
    pub cluster_id: String,
    /// Check kind (active, passive)
    pub kind: String,
    /// New state (healthy, unhealthy, unknown)
    pub to: String,
}

/// Labels for per-cluster metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    /// Cluster ID
    pub cluster_id: String,
}

/// Metrics registry with all gateway metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    /// Configuration reloads by outcome
    reloads_total: Family<ReloadLabels, Counter>,
    /// Reload duration
    reload_duration_seconds: Histogram,
    /// Runtime clusters
    clusters: Gauge,
    /// Runtime routes
    routes: Gauge,
    /// Endpoint snapshots published
    endpoint_publishes_total: Counter,
    /// Cluster lifecycle changes
    cluster_changes_total: Family<ClusterChangeLabels, Counter>,
    /// Destination health transitions
    health_transitions_total: Family<TransitionLabels, Counter>,
    /// Available destinations per cluster
    available_destinations: Family<ClusterLabels, Gauge>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reloads_total = Family::<ReloadLabels, Counter>::default();
        registry.register(
            "gateway_config_reloads",
            "Total configuration reloads by outcome",
            reloads_total.clone(),
        );

        // 1ms to ~4s
        let reload_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 13));
        registry.register(
            "gateway_config_reload_duration_seconds",
            "Configuration reload duration in seconds",
            reload_duration_seconds.clone(),
        );

        let clusters = Gauge::default();
        registry.register("gateway_clusters", "Number of runtime clusters", clusters.clone());

        let routes = Gauge::default();
        registry.register("gateway_routes", "Number of runtime routes", routes.clone());

        let endpoint_publishes_total = Counter::default();
        registry.register(
            "gateway_endpoint_publishes",
            "Total route endpoint snapshots published",
            endpoint_publishes_total.clone(),
        );

        let cluster_changes_total = Family::<ClusterChangeLabels, Counter>::default();
        registry.register(
            "gateway_cluster_changes",
            "Total cluster lifecycle changes",
            cluster_changes_total.clone(),
        );

        let health_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "gateway_health_transitions",
            "Total destination health transitions",
            health_transitions_total.clone(),
        );

        let available_destinations = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "gateway_available_destinations",
            "Destinations currently eligible for traffic",
            available_destinations.clone(),
        );

        Self {
            registry,
            reloads_total,
            reload_duration_seconds,
            clusters,
            routes,
            endpoint_publishes_total,
            cluster_changes_total,
            health_transitions_total,
            available_destinations,
        }
    }

    /// Record a finished reload
    pub fn record_reload(&self, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.reloads_total
            .get_or_create(&ReloadLabels {
                outcome: outcome.to_string(),
            })
            .inc();
        self.reload_duration_seconds.observe(duration.as_secs_f64());
    }

    /// Update runtime cluster and route counts
    pub fn update_counts(&self, clusters: usize, routes: usize) {
        self.clusters.set(clusters as i64);
        self.routes.set(routes as i64);
    }

    /// Record an endpoint snapshot publication
    pub fn record_endpoint_publish(&self) {
        self.endpoint_publishes_total.inc();
    }

    /// Record a cluster lifecycle change
    pub fn record_cluster_change(&self, cluster_id: &str, change: ClusterChange) {
        let change = match change {
            ClusterChange::Added => "added",
            ClusterChange::Changed => "changed",
            ClusterChange::Removed => {
                self.available_destinations.remove(&ClusterLabels {
                    cluster_id: cluster_id.to_string(),
                });
                "removed"
            }
        };
        self.cluster_changes_total
            .get_or_create(&ClusterChangeLabels {
                change: change.to_string(),
            })
            .inc();
    }

    /// Record a destination health transition
    pub fn record_transition(&self, transition: &HealthTransition) {
        self.health_transitions_total
            .get_or_create(&TransitionLabels {
                cluster_id: transition.cluster_id.clone(),
                kind: transition.kind.to_string(),
                to: health_to_string(transition.to).to_string(),
            })
            .inc();
    }

    /// Update the available destination count of a cluster
    pub fn update_available_destinations(&self, cluster_id: &str, count: usize) {
        self.available_destinations
            .get_or_create(&ClusterLabels {
                cluster_id: cluster_id.to_string(),
            })
            .set(count as i64);
    }
}

/// Convert a health verdict to a label value
fn health_to_string(health: DestinationHealth) -> &'static str {
    match health {
        DestinationHealth::Unknown => "unknown",
        DestinationHealth::Healthy => "healthy",
        DestinationHealth::Unhealthy => "unhealthy",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthcheck::HealthCheckKind;
    use prometheus_client::encoding::text::encode;

    fn encoded(registry: &MetricsRegistry) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &registry.registry).unwrap();
        buffer
    }

    #[test]
    fn test_reload_outcomes() {
        let registry = MetricsRegistry::new();
        registry.record_reload(true, Duration::from_millis(5));
        registry.record_reload(false, Duration::from_millis(7));
        registry.record_reload(true, Duration::from_millis(3));

        let text = encoded(&registry);
        assert!(text.contains(r#"gateway_config_reloads_total{outcome="success"} 2"#));
        assert!(text.contains(r#"gateway_config_reloads_total{outcome="failure"} 1"#));
    }

    #[test]
    fn test_counts_and_publishes() {
        let registry = MetricsRegistry::new();
        registry.update_counts(3, 5);
        registry.record_endpoint_publish();

        let text = encoded(&registry);
        assert!(text.contains("gateway_clusters 3"));
        assert!(text.contains("gateway_routes 5"));
        assert!(text.contains("gateway_endpoint_publishes_total 1"));
    }

    #[test]
    fn test_health_transition_labels() {
        let registry = MetricsRegistry::new();
        registry.record_transition(&HealthTransition {
            cluster_id: "c1".to_string(),
            destination_id: "d1".to_string(),
            kind: HealthCheckKind::Passive,
            from: DestinationHealth::Healthy,
            to: DestinationHealth::Unhealthy,
        });

        let text = encoded(&registry);
        assert!(text.contains(r#"cluster_id="c1""#));
        assert!(text.contains(r#"kind="passive""#));
        assert!(text.contains(r#"to="unhealthy""#));
    }

    #[test]
    fn test_removed_cluster_drops_available_gauge() {
        let registry = MetricsRegistry::new();
        registry.update_available_destinations("c1", 2);
        assert!(encoded(&registry).contains(r#"gateway_available_destinations{cluster_id="c1"} 2"#));

        registry.record_cluster_change("c1", ClusterChange::Removed);

        let text = encoded(&registry);
        assert!(!text.contains(r#"gateway_available_destinations{cluster_id="c1"}"#));
        assert!(text.contains(r#"gateway_cluster_changes_total{change="removed"} 1"#));
    }

    #[test]
    fn test_health_to_string() {
        assert_eq!(health_to_string(DestinationHealth::Unknown), "unknown");
        assert_eq!(health_to_string(DestinationHealth::Healthy), "healthy");
        assert_eq!(health_to_string(DestinationHealth::Unhealthy), "unhealthy");
    }
}
