//! Destination health checking for the gateway.
//!
//! This crate decides which destinations of a cluster are healthy:
//! - Active checks probe each destination over HTTP on the cluster's interval
//! - Passive checks evaluate the outcome of proxied requests
//!
//! Verdicts flow through the [`DestinationHealthUpdater`], which writes them to
//! the destination and triggers a recomputation of the cluster's available
//! destinations.
//!
//! # Features
//!
//! - Per-entity timers driven by a single task ([`EntityActionScheduler`])
//! - Pluggable active and passive policies and probe request factories
//! - Temporary passive verdicts with automatic reactivation
//! - A broadcast stream of every health transition
//!
//! # Example
//!
//! ```no_run
//! use healthcheck::{
//!     ActiveHealthCheckMonitor, ActiveHealthCheckPolicy, ConsecutiveFailuresHealthPolicy,
//!     DefaultProbingRequestFactory, DestinationHealthUpdater, MonitorOptions,
//! };
//! use model::{ClusterDestinationsUpdater, ClusterState};
//! use std::sync::Arc;
//!
//! # async fn example(clusters: Vec<Arc<ClusterState>>) {
//! let destinations = Arc::new(ClusterDestinationsUpdater::new([]));
//! let health_updater = Arc::new(DestinationHealthUpdater::new(destinations));
//! let policy: Arc<dyn ActiveHealthCheckPolicy> =
//!     Arc::new(ConsecutiveFailuresHealthPolicy::new(health_updater.clone()));
//!
//! let monitor = ActiveHealthCheckMonitor::new(
//!     MonitorOptions::default(),
//!     [policy],
//!     Arc::new(DefaultProbingRequestFactory),
//! );
//!
//! // Probe once, then keep probing on each cluster's interval.
//! monitor.check_health(clusters).await;
//! assert!(monitor.initial_probe_completed());
//! # }
//! ```

pub mod health_updater;
pub mod monitor;
pub mod passive;
pub mod policy;
pub mod probing;
pub mod scheduler;
pub mod types;

pub use health_updater::DestinationHealthUpdater;
pub use monitor::ActiveHealthCheckMonitor;
pub use passive::{
    PassiveHealthCheckPolicy, ProxyOutcome, TransportFailureRateHealthPolicy,
    TransportFailureRateOptions,
};
pub use policy::{ActiveHealthCheckPolicy, ConsecutiveFailuresHealthPolicy};
pub use probing::{DefaultProbingRequestFactory, ProbingRequestFactory};
pub use scheduler::{EntityActionScheduler, SchedulerMode};
pub use types::{
    DestinationProbingResult, HealthCheckKind, HealthTransition, MonitorOptions,
    NewActiveDestinationHealth, ProbeResponse,
};
