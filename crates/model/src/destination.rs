//! Destination runtime state.

use crate::concurrency::ConcurrencyCounter;
use crate::config::DestinationConfig;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Health verdict for one kind of health check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DestinationHealth {
    /// No verdict yet; treated as available
    #[default]
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl DestinationHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DestinationHealth::Healthy,
            2 => DestinationHealth::Unhealthy,
            _ => DestinationHealth::Unknown,
        }
    }
}

impl fmt::Display for DestinationHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationHealth::Unknown => write!(f, "UNKNOWN"),
            DestinationHealth::Healthy => write!(f, "HEALTHY"),
            DestinationHealth::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

/// Mutable health record of a destination.
///
/// Both fields are written directly by the health subsystem and read
/// lock-free by the request path. They live outside [`DestinationModel`] so a
/// health change never requires a model swap.
#[derive(Debug, Default)]
pub struct DestinationHealthState {
    active: AtomicU8,
    passive: AtomicU8,
}

impl DestinationHealthState {
    pub fn active(&self) -> DestinationHealth {
        DestinationHealth::from_u8(self.active.load(Ordering::Acquire))
    }

    pub fn set_active(&self, health: DestinationHealth) {
        self.active.store(health as u8, Ordering::Release);
    }

    pub fn passive(&self) -> DestinationHealth {
        DestinationHealth::from_u8(self.passive.load(Ordering::Acquire))
    }

    pub fn set_passive(&self, health: DestinationHealth) {
        self.passive.store(health as u8, Ordering::Release);
    }
}

/// Immutable configuration snapshot of a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationModel {
    pub config: DestinationConfig,
}

impl DestinationModel {
    pub fn new(config: DestinationConfig) -> Self {
        Self { config }
    }

    /// Address probes are sent to: the health address if set, else the main one.
    pub fn probe_address(&self) -> &str {
        self.config.health.as_deref().unwrap_or(&self.config.address)
    }

    pub fn has_changed(&self, config: &DestinationConfig) -> bool {
        self.config != *config
    }
}

/// Runtime state of a single backend endpoint.
///
/// Equality and hashing are by identity: two states are equal only if they
/// are the same object, so a destination removed and re-added under the same
/// id is a different entity.
#[derive(Debug)]
pub struct DestinationState {
    destination_id: String,
    model: ArcSwap<DestinationModel>,
    health: DestinationHealthState,
    concurrency: ConcurrencyCounter,
}

impl DestinationState {
    pub fn new(destination_id: impl Into<String>, model: DestinationModel) -> Self {
        Self {
            destination_id: destination_id.into(),
            model: ArcSwap::from_pointee(model),
            health: DestinationHealthState::default(),
            concurrency: ConcurrencyCounter::default(),
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// Current configuration snapshot.
    pub fn model(&self) -> Arc<DestinationModel> {
        self.model.load_full()
    }

    /// Replace the configuration snapshot. Health is left untouched.
    pub fn set_model(&self, model: DestinationModel) {
        self.model.store(Arc::new(model));
    }

    pub fn health(&self) -> &DestinationHealthState {
        &self.health
    }

    pub fn concurrency(&self) -> &ConcurrencyCounter {
        &self.concurrency
    }
}

impl PartialEq for DestinationState {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for DestinationState {}

impl Hash for DestinationState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self, state);
    }
}
