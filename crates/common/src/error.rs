//! Common error types for the gateway crates.

use std::fmt;
use std::time::Duration;

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {}", join_errors(.0))]
    InvalidConfig(Vec<Error>),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Config provider error: {0}")]
    Provider(String),

    #[error("Initial configuration load failed: {0}")]
    Startup(#[source] Box<Error>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new probe error.
    pub fn probe(msg: impl fmt::Display) -> Self {
        Error::Probe(msg.to_string())
    }

    /// Create a new policy error.
    pub fn policy(msg: impl fmt::Display) -> Self {
        Error::Policy(msg.to_string())
    }

    /// Create a new provider error.
    pub fn provider(msg: impl fmt::Display) -> Self {
        Error::Provider(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    /// Whether this error came from a single health probe.
    pub fn is_transient_probe(&self) -> bool {
        matches!(self, Error::Probe(_) | Error::ProbeTimeout(_))
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_message_lists_every_error() {
        let err = Error::InvalidConfig(vec![
            Error::config("duplicate cluster id 'c1'"),
            Error::config("route 'r1' has no match"),
        ]);

        assert_eq!(
            err.to_string(),
            "Invalid configuration: Configuration error: duplicate cluster id 'c1'; \
             Configuration error: route 'r1' has no match"
        );
    }

    #[test]
    fn test_startup_error_keeps_source() {
        let err = Error::Startup(Box::new(Error::provider("file missing")));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("Config provider error: file missing"));
    }

    #[test]
    fn test_transient_probe_classification() {
        assert!(Error::probe("connection refused").is_transient_probe());
        assert!(Error::ProbeTimeout(Duration::from_secs(1)).is_transient_probe());
        assert!(!Error::policy("boom").is_transient_probe());
    }
}
