//! Gateway control plane.
//!
//! Turns route and cluster configuration into the runtime state a reverse
//! proxy forwards against, and keeps that state current.
//!
//! # Components
//!
//! - **Providers**: supply configuration snapshots with change tokens
//! - **Manager**: filters, validates and reconciles snapshots into runtime
//!   clusters and routes, then publishes route endpoints
//! - **Health checks**: the active monitor listens to cluster changes; passive
//!   outcomes are reported through [`GatewayServer::request_proxied`]
//! - **Metrics**: Prometheus text endpoint served over HTTP

pub mod config;
pub mod endpoints;
pub mod filter;
pub mod http_server;
pub mod manager;
pub mod metrics;
pub mod provider;
pub mod server;
pub mod validation;

pub use config::{Config, ConfigError};
pub use endpoints::EndpointSnapshot;
pub use filter::ProxyConfigFilter;
pub use http_server::MetricsServer;
pub use manager::ProxyConfigManager;
pub use metrics::MetricsRegistry;
pub use provider::{
    FileConfigProvider, InMemoryConfigProvider, ProxyConfigFile, ProxyConfigProvider,
    ProxyConfigSnapshot,
};
pub use server::GatewayServer;
pub use validation::{ConfigValidator, DefaultConfigValidator};
