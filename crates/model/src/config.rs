//! Configuration types for routes, clusters and destinations.
//!
//! These are the plain data snapshots handed to the control plane by config
//! providers. Runtime state wraps them in [`crate::ClusterModel`],
//! [`crate::DestinationModel`] and [`crate::RouteModel`] and replaces them
//! wholesale on change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Cluster configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique cluster id (case-insensitive)
    pub cluster_id: String,

    /// Load balancing policy name, consumed by the forwarding layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_policy: Option<String>,

    /// Active and passive health check settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,

    /// Outbound HTTP client settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_client: Option<HttpClientConfig>,

    /// Destinations keyed by destination id
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,

    /// Arbitrary key/value options, read by policies
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// Compare everything except the destination set.
    ///
    /// Destination changes are applied in place on the cluster's destination
    /// map and do not bump the cluster revision.
    pub fn equals_excluding_destinations(&self, other: &ClusterConfig) -> bool {
        self.cluster_id.eq_ignore_ascii_case(&other.cluster_id)
            && self.load_balancing_policy == other.load_balancing_policy
            && self.health_check == other.health_check
            && self.http_client == other.http_client
            && self.metadata == other.metadata
    }

    /// Active health check settings, if active checks are enabled.
    pub fn active_health_check(&self) -> Option<&ActiveHealthCheckConfig> {
        self.health_check
            .as_ref()
            .and_then(|hc| hc.active.as_ref())
            .filter(|active| active.enabled)
    }

    /// Passive health check settings, if passive checks are enabled.
    pub fn passive_health_check(&self) -> Option<&PassiveHealthCheckConfig> {
        self.health_check
            .as_ref()
            .and_then(|hc| hc.passive.as_ref())
            .filter(|passive| passive.enabled)
    }

    /// Name of the policy that selects available destinations, if set.
    pub fn available_destinations_policy(&self) -> Option<&str> {
        self.health_check
            .as_ref()
            .and_then(|hc| hc.available_destinations_policy.as_deref())
    }
}

/// Health check configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveHealthCheckConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passive: Option<PassiveHealthCheckConfig>,

    /// Policy deciding which destinations receive traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_destinations_policy: Option<String>,
}

/// Active (probing) health check configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Interval between probes; falls back to the monitor default
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,

    /// Timeout of a single probe; falls back to the monitor default
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Evaluation policy name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,

    /// Probe path appended to the destination address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Probe query string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Passive (traffic-observing) health check configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassiveHealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Evaluation policy name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,

    /// How long a destination stays passively unhealthy before retrying it
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub reactivation_period: Option<Duration>,
}

/// Outbound HTTP client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default)]
    pub danger_accept_invalid_certificates: bool,

    /// Idle pooled connections kept per destination host. Does not cap
    /// concurrent connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_connections_per_server: Option<usize>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,
}

/// Destination configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Base address, e.g. `https://10.0.0.1:8443/`
    pub address: String,

    /// Dedicated address for health probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,

    /// Host header override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Route configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Unique route id (case-insensitive)
    pub route_id: String,

    /// Target cluster; may name a cluster that does not exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Match priority, lower first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,

    #[serde(rename = "match", default)]
    pub matcher: RouteMatch,

    /// Request/response transforms, applied by the forwarding layer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<BTreeMap<String, String>>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Route match criteria
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<RouteHeader>,
}

/// Header match criterion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHeader {
    pub name: String,

    #[serde(default)]
    pub values: Vec<String>,

    #[serde(default)]
    pub mode: HeaderMatchMode,

    #[serde(default)]
    pub is_case_sensitive: bool,
}

/// How header values are compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMatchMode {
    #[default]
    Exact,
    Prefix,
    Contains,
    Exists,
}
