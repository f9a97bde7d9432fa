//! Health tracking for the rollout controller
//!
//! Tracks the reconciliation driver's phase and the resource store's
//! reachability for Kubernetes liveness and readiness probes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive watch failures after which the store is reported unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational, but retrying
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Lifecycle of the reconciliation driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverPhase {
    /// Initial listing not finished yet
    Starting,
    Watching,
    /// Waiting to reopen the watch after a failure
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub phase: DriverPhase,
    pub components: HashMap<String, ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_timestamp: Option<i64>,
}

impl HealthResponse {
    /// Worst status across components.
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max_by_key(|s| match s {
                ComponentStatus::Healthy => 0,
                ComponentStatus::Degraded => 1,
                ComponentStatus::Unhealthy => 2,
            })
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const DRIVER: &str = "driver";
    pub const RESOURCE_STORE: &str = "resource_store";
}

#[derive(Debug)]
struct HealthState {
    phase: DriverPhase,
    components: HashMap<String, ComponentHealth>,
    consecutive_watch_failures: u32,
    last_event_timestamp: Option<i64>,
}

/// Shared health state, updated by the driver and read by the probes.
#[derive(Debug, Clone)]
pub struct ControllerHealth {
    state: Arc<RwLock<HealthState>>,
}

impl Default for ControllerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerHealth {
    pub fn new() -> Self {
        let components = [components::DRIVER, components::RESOURCE_STORE]
            .into_iter()
            .map(|name| (name.to_string(), ComponentHealth::healthy()))
            .collect();
        Self {
            state: Arc::new(RwLock::new(HealthState {
                phase: DriverPhase::Starting,
                components,
                consecutive_watch_failures: 0,
                last_event_timestamp: None,
            })),
        }
    }

    pub async fn set_phase(&self, phase: DriverPhase) {
        let mut state = self.state.write().await;
        state.phase = phase;
        let driver = match phase {
            DriverPhase::Stopped => ComponentHealth::unhealthy("reconciliation driver stopped"),
            _ => ComponentHealth::healthy(),
        };
        state.components.insert(components::DRIVER.to_string(), driver);
    }

    pub async fn phase(&self) -> DriverPhase {
        self.state.read().await.phase
    }

    /// A watch was opened.
    pub async fn record_watch_success(&self) {
        let mut state = self.state.write().await;
        state.consecutive_watch_failures = 0;
        state
            .components
            .insert(components::RESOURCE_STORE.to_string(), ComponentHealth::healthy());
    }

    /// A watch could not be opened or broke off with an error.
    pub async fn record_watch_failure(&self, message: impl Into<String>) {
        let mut state = self.state.write().await;
        state.consecutive_watch_failures += 1;
        let health = if state.consecutive_watch_failures >= UNHEALTHY_AFTER_FAILURES {
            ComponentHealth::unhealthy(message)
        } else {
            ComponentHealth::degraded(message)
        };
        state
            .components
            .insert(components::RESOURCE_STORE.to_string(), health);
    }

    pub async fn consecutive_watch_failures(&self) -> u32 {
        self.state.read().await.consecutive_watch_failures
    }

    pub async fn record_event(&self) {
        self.state.write().await.last_event_timestamp = Some(chrono::Utc::now().timestamp());
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: HealthResponse::compute_status(&state.components),
            phase: state.phase,
            components: state.components.clone(),
            last_event_timestamp: state.last_event_timestamp,
        }
    }

    /// Ready once the initial listing is done, as long as the driver runs
    /// and the store has not been failing persistently.
    pub async fn readiness(&self) -> ReadinessResponse {
        let health = self.health().await;
        let reason = match health.phase {
            DriverPhase::Starting => Some("Initial reconciliation not finished"),
            DriverPhase::Stopped => Some("Reconciliation driver stopped"),
            _ if health.status == ComponentStatus::Unhealthy => Some("Resource store unreachable"),
            _ => None,
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }
}
