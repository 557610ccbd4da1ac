//! Structural validation of routes and clusters.

use async_trait::async_trait;
use common::Error;
use model::{ClusterConfig, RouteConfig, id_key};
use reqwest::Url;
use std::collections::HashSet;
use std::time::Duration;

/// Checks a single route or cluster. Returns every problem found.
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    async fn validate_cluster(&self, cluster: &ClusterConfig) -> Vec<Error>;

    async fn validate_route(&self, route: &RouteConfig) -> Vec<Error>;
}

/// Built-in validator.
///
/// Knows the names of the registered health and availability policies so a
/// typo in a policy name is rejected at load time.
#[derive(Debug, Clone, Default)]
pub struct DefaultConfigValidator {
    active_policies: HashSet<String>,
    passive_policies: HashSet<String>,
    available_destinations_policies: HashSet<String>,
}

impl DefaultConfigValidator {
    pub fn new(
        active_policies: impl IntoIterator<Item = String>,
        passive_policies: impl IntoIterator<Item = String>,
        available_destinations_policies: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            active_policies: lowercased(active_policies),
            passive_policies: lowercased(passive_policies),
            available_destinations_policies: lowercased(available_destinations_policies),
        }
    }

    fn check_policy(
        &self,
        cluster_id: &str,
        kind: &str,
        name: Option<&str>,
        known: &HashSet<String>,
        errors: &mut Vec<Error>,
    ) {
        if let Some(name) = name {
            if !known.contains(&name.to_ascii_lowercase()) {
                errors.push(Error::config(format!(
                    "cluster '{}': unknown {} policy '{}'",
                    cluster_id, kind, name
                )));
            }
        }
    }
}

fn lowercased(names: impl IntoIterator<Item = String>) -> HashSet<String> {
    names.into_iter().map(|n| n.to_ascii_lowercase()).collect()
}

fn check_positive(
    cluster_id: &str,
    field: &str,
    value: Option<Duration>,
    errors: &mut Vec<Error>,
) {
    if value.is_some_and(|d| d.is_zero()) {
        errors.push(Error::config(format!(
            "cluster '{}': {} must be positive",
            cluster_id, field
        )));
    }
}

fn check_address(cluster_id: &str, destination_id: &str, field: &str, address: &str, errors: &mut Vec<Error>) {
    let valid = Url::parse(address)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false);
    if !valid {
        errors.push(Error::config(format!(
            "cluster '{}', destination '{}': {} '{}' is not an absolute http(s) URL",
            cluster_id, destination_id, field, address
        )));
    }
}

#[async_trait]
impl ConfigValidator for DefaultConfigValidator {
    async fn validate_cluster(&self, cluster: &ClusterConfig) -> Vec<Error> {
        let mut errors = Vec::new();
        let id = cluster.cluster_id.as_str();

        if id.trim().is_empty() {
            errors.push(Error::config("cluster id must not be empty"));
        }

        let mut destination_keys = HashSet::new();
        for (destination_id, destination) in &cluster.destinations {
            if !destination_keys.insert(id_key(destination_id)) {
                errors.push(Error::config(format!(
                    "cluster '{}': duplicate destination id '{}'",
                    id, destination_id
                )));
            }
            if destination_id.trim().is_empty() {
                errors.push(Error::config(format!(
                    "cluster '{}': destination id must not be empty",
                    id
                )));
            }
            check_address(id, destination_id, "address", &destination.address, &mut errors);
            if let Some(health) = &destination.health {
                check_address(id, destination_id, "health address", health, &mut errors);
            }
        }

        if let Some(health_check) = &cluster.health_check {
            if let Some(active) = health_check.active.as_ref().filter(|a| a.enabled) {
                self.check_policy(id, "active health", active.policy.as_deref(), &self.active_policies, &mut errors);
                check_positive(id, "active interval", active.interval, &mut errors);
                check_positive(id, "active timeout", active.timeout, &mut errors);
                if let Some(path) = &active.path {
                    if !path.is_empty() && !path.starts_with('/') {
                        errors.push(Error::config(format!(
                            "cluster '{}': probe path '{}' must start with '/'",
                            id, path
                        )));
                    }
                }
            }

            if let Some(passive) = health_check.passive.as_ref().filter(|p| p.enabled) {
                self.check_policy(id, "passive health", passive.policy.as_deref(), &self.passive_policies, &mut errors);
                check_positive(id, "reactivation period", passive.reactivation_period, &mut errors);
            }

            self.check_policy(
                id,
                "available destinations",
                health_check.available_destinations_policy.as_deref(),
                &self.available_destinations_policies,
                &mut errors,
            );
        }

        errors
    }

    async fn validate_route(&self, route: &RouteConfig) -> Vec<Error> {
        let mut errors = Vec::new();
        let id = route.route_id.as_str();

        if id.trim().is_empty() {
            errors.push(Error::config("route id must not be empty"));
        }

        if route.cluster_id.as_deref().is_none_or(|c| c.trim().is_empty()) {
            errors.push(Error::config(format!("route '{}': cluster id is required", id)));
        }

        let matcher = &route.matcher;
        match matcher.path.as_deref() {
            Some(path) if !path.starts_with('/') => errors.push(Error::config(format!(
                "route '{}': path '{}' must start with '/'",
                id, path
            ))),
            None if matcher.hosts.is_empty() => errors.push(Error::config(format!(
                "route '{}': match requires a path or at least one host",
                id
            ))),
            _ => {}
        }

        if matcher.hosts.iter().any(|h| h.trim().is_empty()) {
            errors.push(Error::config(format!("route '{}': empty host", id)));
        }

        for method in &matcher.methods {
            if reqwest::Method::from_bytes(method.as_bytes()).is_err() {
                errors.push(Error::config(format!(
                    "route '{}': invalid method '{}'",
                    id, method
                )));
            }
        }

        for header in &matcher.headers {
            if header.name.trim().is_empty() {
                errors.push(Error::config(format!("route '{}': header name must not be empty", id)));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::config::RouteHeader;
    use model::{
        ActiveHealthCheckConfig, DestinationConfig, HealthCheckConfig, PassiveHealthCheckConfig,
        RouteMatch,
    };

    fn validator() -> DefaultConfigValidator {
        DefaultConfigValidator::new(
            ["ConsecutiveFailures".to_string()],
            ["TransportFailureRate".to_string()],
            ["HealthyAndUnknown".to_string(), "HealthyOrPanic".to_string()],
        )
    }

    fn cluster() -> ClusterConfig {
        let mut cluster = ClusterConfig {
            cluster_id: "c1".to_string(),
            ..Default::default()
        };
        cluster.destinations.insert(
            "d1".to_string(),
            DestinationConfig {
                address: "http://10.0.0.1:8080/".to_string(),
                ..Default::default()
            },
        );
        cluster
    }

    fn route() -> RouteConfig {
        RouteConfig {
            route_id: "r1".to_string(),
            cluster_id: Some("c1".to_string()),
            matcher: RouteMatch {
                path: Some("/api".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_valid_config_passes() {
        let validator = validator();
        let mut cluster = cluster();
        cluster.health_check = Some(HealthCheckConfig {
            active: Some(ActiveHealthCheckConfig {
                enabled: true,
                policy: Some("consecutivefailures".to_string()),
                interval: Some(Duration::from_secs(5)),
                path: Some("/healthz".to_string()),
                ..Default::default()
            }),
            passive: Some(PassiveHealthCheckConfig {
                enabled: true,
                policy: Some("TransportFailureRate".to_string()),
                reactivation_period: Some(Duration::from_secs(30)),
            }),
            available_destinations_policy: Some("HealthyOrPanic".to_string()),
        });

        assert!(validator.validate_cluster(&cluster).await.is_empty());
        assert!(validator.validate_route(&route()).await.is_empty());
    }

    #[tokio::test]
    async fn test_cluster_errors_are_collected() {
        let validator = validator();
        let mut cluster = cluster();
        cluster.cluster_id = " ".to_string();
        cluster.destinations.insert(
            "d2".to_string(),
            DestinationConfig {
                address: "10.0.0.2:80".to_string(),
                health: Some("ftp://10.0.0.2/".to_string()),
                ..Default::default()
            },
        );
        cluster.health_check = Some(HealthCheckConfig {
            active: Some(ActiveHealthCheckConfig {
                enabled: true,
                policy: Some("Nope".to_string()),
                timeout: Some(Duration::ZERO),
                ..Default::default()
            }),
            ..Default::default()
        });

        let errors = validator.validate_cluster(&cluster).await;
        // empty id, bad address, bad health address, unknown policy, zero timeout
        assert_eq!(errors.len(), 5, "{:?}", errors);
    }

    #[tokio::test]
    async fn test_destination_ids_differing_in_case_are_duplicates() {
        let mut cluster = cluster();
        cluster.destinations.insert(
            "D1".to_string(),
            DestinationConfig {
                address: "http://10.0.0.9/".to_string(),
                ..Default::default()
            },
        );

        let errors = validator().validate_cluster(&cluster).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("duplicate destination id"));
    }

    #[tokio::test]
    async fn test_disabled_checks_are_not_validated() {
        let validator = validator();
        let mut cluster = cluster();
        cluster.health_check = Some(HealthCheckConfig {
            active: Some(ActiveHealthCheckConfig {
                enabled: false,
                policy: Some("Nope".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });

        assert!(validator.validate_cluster(&cluster).await.is_empty());
    }

    #[tokio::test]
    async fn test_route_errors() {
        let validator = validator();

        let mut missing_cluster = route();
        missing_cluster.cluster_id = None;
        assert_eq!(validator.validate_route(&missing_cluster).await.len(), 1);

        let mut no_match = route();
        no_match.matcher = RouteMatch::default();
        assert_eq!(validator.validate_route(&no_match).await.len(), 1);

        let mut host_only = route();
        host_only.matcher = RouteMatch {
            hosts: vec!["example.com".to_string()],
            ..Default::default()
        };
        assert!(validator.validate_route(&host_only).await.is_empty());

        let mut bad = route();
        bad.matcher.path = Some("api".to_string());
        bad.matcher.methods = vec!["GE T".to_string()];
        bad.matcher.headers = vec![RouteHeader::default()];
        assert_eq!(validator.validate_route(&bad).await.len(), 3);
    }
}
