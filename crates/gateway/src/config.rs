//! Process settings loading and validation for the gateway

use healthcheck::{MonitorOptions, TransportFailureRateOptions};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Settings error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.proxy.validate()?;
        self.health.validate()?;
        self.metrics.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Route and cluster source
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProxySettings {
    /// YAML file with `routes` and `clusters`
    #[validate(length(min = 1))]
    pub config_path: String,
}

/// Health check defaults
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_positive_duration")]
    pub default_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_positive_duration")]
    pub default_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_positive_duration")]
    pub default_reactivation_period: Duration,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LoggingSettings {
    pub level: Option<String>,

    #[validate(custom = "validate_log_format")]
    pub format: Option<String>,
}

impl LoggingSettings {
    pub fn is_json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

// Default implementations

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            config_path: "/etc/gateway/proxy.yaml".to_string(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(15),
            default_timeout: Duration::from_secs(10),
            default_reactivation_period: Duration::from_secs(10),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9100".to_string(),
        }
    }
}

// Custom validators

fn validate_positive_duration(duration: &Duration) -> Result<(), ValidationError> {
    if duration.is_zero() {
        return Err(ValidationError::new("duration_must_be_positive"));
    }
    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "text" | "json" => Ok(()),
        _ => Err(ValidationError::new("log_format_unknown")),
    }
}

// Settings loading implementation

impl Config {
    /// Load settings from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load settings from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find settings file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/gateway/gateway.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./gateway.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/gateway/gateway.yaml"))
    }

    /// Active monitor defaults
    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            default_interval: self.health.default_interval,
            default_timeout: self.health.default_timeout,
        }
    }

    /// Passive policy settings
    pub fn transport_failure_options(&self) -> TransportFailureRateOptions {
        TransportFailureRateOptions {
            default_reactivation_period: self.health.default_reactivation_period,
            ..Default::default()
        }
    }
}
