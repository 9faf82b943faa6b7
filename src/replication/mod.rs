//! Replication Module
//!
//! Drives the acknowledgement-based store and remove protocols and the
//! periodic rebalancing of replica placement.

pub mod acks;
pub mod placement;
mod coordinator;
mod rebalance;

pub use acks::{AckKey, AckOutcome, AckTracker, AckWait, DeparturePolicy};
pub use coordinator::Coordinator;
pub use rebalance::{RebalanceReport, Rebalancer};

use std::time::Duration;

use crate::config::ControllerConfig;

/// Configuration for replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Replicas required per file (R)
    pub replication_factor: usize,
    /// Upper bound on every acknowledgement wait
    pub timeout: Duration,
    /// Interval between rebalance passes
    pub rebalance_period: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            timeout: Duration::from_millis(1000),
            rebalance_period: Duration::from_millis(30_000),
        }
    }
}

impl From<&ControllerConfig> for ReplicationConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            replication_factor: config.controller.replication_factor,
            timeout: config.timeout(),
            rebalance_period: config.rebalance_period(),
        }
    }
}
