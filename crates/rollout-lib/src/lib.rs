//! Rollout engine for VerticalPodAutoscaler recommendations
//!
//! This crate provides the core functionality for:
//! - Deciding when a workload's live requests have drifted from its recommendation
//! - Rate limiting and health gating of disruptive restarts
//! - Surge buffer workloads that hold capacity during a restart
//! - The persisted rollout state machine and the watch-driven reconciliation loop
//! - Health checks and observability

pub mod annotations;
pub mod clock;
pub mod cooldown;
pub mod divergence;
pub mod document;
pub mod driver;
pub mod eligibility;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod rollout;
pub mod store;
pub mod surge;
pub mod units;
pub mod workload;

#[cfg(test)]
mod testing;

/// Name the controller reports itself under in logs.
pub const CONTROLLER_NAME: &str = "vpa-rollout-controller";

pub use clock::{Clock, SystemClock};
pub use driver::{DriverConfig, DriverHandle, ReconciliationDriver};
pub use error::{Result, RolloutError, ShapeError, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, ControllerHealth, DriverPhase, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, RolloutLogger};
pub use rollout::{EngineConfig, Outcome, RolloutEngine};
pub use store::{KubeStore, ResourceStore};
