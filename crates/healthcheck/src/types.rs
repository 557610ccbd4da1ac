//! Health check types and structures.

use common::Error;
use model::{DestinationHealth, DestinationState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Response of a single probe
#[derive(Debug, Clone, Copy)]
pub struct ProbeResponse {
    pub status: reqwest::StatusCode,

    /// Time from sending the request to receiving response headers
    pub latency: Duration,
}

/// Outcome of probing one destination.
///
/// Exactly one of `response` and `error` is set.
#[derive(Debug)]
pub struct DestinationProbingResult {
    pub destination: Arc<DestinationState>,
    pub response: Option<ProbeResponse>,
    pub error: Option<Error>,
}

impl DestinationProbingResult {
    pub fn responded(destination: Arc<DestinationState>, response: ProbeResponse) -> Self {
        Self {
            destination,
            response: Some(response),
            error: None,
        }
    }

    pub fn failed(destination: Arc<DestinationState>, error: Error) -> Self {
        Self {
            destination,
            response: None,
            error: Some(error),
        }
    }

    /// Whether the probe got a 2xx response
    pub fn is_success(&self) -> bool {
        self.response.is_some_and(|r| r.status.is_success())
    }
}

/// New active health verdict for one destination
#[derive(Debug, Clone)]
pub struct NewActiveDestinationHealth {
    pub destination: Arc<DestinationState>,
    pub health: DestinationHealth,
}

impl NewActiveDestinationHealth {
    pub fn new(destination: Arc<DestinationState>, health: DestinationHealth) -> Self {
        Self {
            destination,
            health,
        }
    }
}

/// Which health check produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthCheckKind {
    Active,
    Passive,
}

impl fmt::Display for HealthCheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheckKind::Active => write!(f, "active"),
            HealthCheckKind::Passive => write!(f, "passive"),
        }
    }
}

/// A destination health field changed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub cluster_id: String,
    pub destination_id: String,
    pub kind: HealthCheckKind,
    pub from: DestinationHealth,
    pub to: DestinationHealth,
}

/// Defaults applied to clusters that leave probe settings unset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorOptions {
    /// Probe interval
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,

    /// Per-probe timeout
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(15),
            default_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{DestinationConfig, DestinationModel};

    fn destination() -> Arc<DestinationState> {
        Arc::new(DestinationState::new(
            "d1",
            DestinationModel::new(DestinationConfig {
                address: "http://127.0.0.1:1/".to_string(),
                ..Default::default()
            }),
        ))
    }

    #[test]
    fn test_probing_result_success() {
        let ok = DestinationProbingResult::responded(
            destination(),
            ProbeResponse {
                status: reqwest::StatusCode::NO_CONTENT,
                latency: Duration::from_millis(3),
            },
        );
        assert!(ok.is_success());

        let server_error = DestinationProbingResult::responded(
            destination(),
            ProbeResponse {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                latency: Duration::from_millis(3),
            },
        );
        assert!(!server_error.is_success());

        let refused = DestinationProbingResult::failed(destination(), Error::probe("refused"));
        assert!(!refused.is_success());
    }

    #[test]
    fn test_monitor_options_defaults() {
        let options = MonitorOptions::default();
        assert_eq!(options.default_interval, Duration::from_secs(15));
        assert_eq!(options.default_timeout, Duration::from_secs(10));
        assert_eq!(HealthCheckKind::Passive.to_string(), "passive");
    }
}
