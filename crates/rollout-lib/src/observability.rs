//! Observability infrastructure for the rollout controller
//!
//! Provides:
//! - Prometheus metrics (reconcile latency, outcomes, rollouts, surge workloads, watch restarts)
//! - Structured JSON logging of rollout lifecycle events with tracing

use crate::models::RolloutStatus;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for reconcile latency (in seconds). Reconciles are
/// dominated by store round trips.
const RECONCILE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    reconcile_duration_seconds: Histogram,
    reconciliations: IntCounterVec,
    reconcile_errors: IntCounterVec,
    rollouts_triggered: IntCounterVec,
    status_transitions: IntCounterVec,
    surge_workloads_created: IntCounter,
    surge_workloads_deleted: IntCounter,
    watch_restarts: IntCounterVec,
    resume_revision: IntGauge,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "vpa_rollout_reconcile_duration_seconds",
                "Time spent reconciling a single recommendation",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            reconciliations: register_int_counter_vec!(
                "vpa_rollout_reconciliations_total",
                "Reconciliations by outcome",
                &["outcome"]
            )
            .expect("Failed to register reconciliations_total"),

            reconcile_errors: register_int_counter_vec!(
                "vpa_rollout_reconcile_errors_total",
                "Failed reconciliations by error kind",
                &["kind"]
            )
            .expect("Failed to register reconcile_errors_total"),

            rollouts_triggered: register_int_counter_vec!(
                "vpa_rollout_rollouts_triggered_total",
                "Rollouts started, by path (direct or surge)",
                &["path"]
            )
            .expect("Failed to register rollouts_triggered_total"),

            status_transitions: register_int_counter_vec!(
                "vpa_rollout_status_transitions_total",
                "Persisted rollout status transitions, by new status",
                &["to"]
            )
            .expect("Failed to register status_transitions_total"),

            surge_workloads_created: register_int_counter!(
                "vpa_rollout_surge_workloads_created_total",
                "Surge buffer workloads created"
            )
            .expect("Failed to register surge_workloads_created_total"),

            surge_workloads_deleted: register_int_counter!(
                "vpa_rollout_surge_workloads_deleted_total",
                "Surge buffer workloads deleted"
            )
            .expect("Failed to register surge_workloads_deleted_total"),

            watch_restarts: register_int_counter_vec!(
                "vpa_rollout_watch_restarts_total",
                "Watch reconnects, by reason",
                &["reason"]
            )
            .expect("Failed to register watch_restarts_total"),

            resume_revision: register_int_gauge!(
                "vpa_rollout_resume_revision",
                "Revision the recommendation watch resumes from"
            )
            .expect("Failed to register resume_revision"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// A lightweight handle to the process-wide metrics; clones share them.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new)
    }

    pub fn observe_reconcile(&self, duration_secs: f64, outcome: &str) {
        self.inner().reconcile_duration_seconds.observe(duration_secs);
        self.inner()
            .reconciliations
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_reconcile_errors(&self, kind: &str) {
        self.inner().reconcile_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_rollouts_triggered(&self, path: &str) {
        self.inner().rollouts_triggered.with_label_values(&[path]).inc();
    }

    pub fn inc_status_transitions(&self, to: RolloutStatus) {
        let label = match to {
            RolloutStatus::Stable => "stable",
            other => other.as_str(),
        };
        self.inner().status_transitions.with_label_values(&[label]).inc();
    }

    pub fn inc_surge_created(&self) {
        self.inner().surge_workloads_created.inc();
    }

    pub fn inc_surge_deleted(&self) {
        self.inner().surge_workloads_deleted.inc();
    }

    pub fn inc_watch_restarts(&self, reason: &str) {
        self.inner().watch_restarts.with_label_values(&[reason]).inc();
    }

    pub fn set_resume_revision(&self, revision: &str) {
        if let Ok(revision) = revision.parse::<i64>() {
            self.inner().resume_revision.set(revision);
        }
    }
}

/// Structured logger for rollout lifecycle events
#[derive(Clone)]
pub struct RolloutLogger {
    controller: String,
}

impl RolloutLogger {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    pub fn log_rollout_triggered(&self, recommendation: &str, target: &str, path: &str) {
        info!(
            event = "rollout_triggered",
            controller = %self.controller,
            recommendation = %recommendation,
            target = %target,
            path = %path,
            "Rollout triggered"
        );
    }

    pub fn log_restart(&self, recommendation: &str, target: &str, restarted_at: &str) {
        info!(
            event = "restart_patched",
            controller = %self.controller,
            recommendation = %recommendation,
            target = %target,
            restarted_at = %restarted_at,
            "Patched restart timestamp"
        );
    }

    pub fn log_status_transition(&self, recommendation: &str, from: RolloutStatus, to: RolloutStatus) {
        info!(
            event = "status_transition",
            controller = %self.controller,
            recommendation = %recommendation,
            from = ?from,
            to = ?to,
            "Rollout status changed"
        );
    }

    pub fn log_surge_created(&self, recommendation: &str, surge: &str, replicas: i64) {
        info!(
            event = "surge_created",
            controller = %self.controller,
            recommendation = %recommendation,
            surge = %surge,
            replicas = replicas,
            "Created surge buffer workload"
        );
    }

    pub fn log_surge_deleted(&self, recommendation: &str, surge: &str, existed: bool) {
        info!(
            event = "surge_deleted",
            controller = %self.controller,
            recommendation = %recommendation,
            surge = %surge,
            existed = existed,
            "Removed surge buffer workload"
        );
    }

    pub fn log_orphan_adopted(&self, recommendation: &str, surge: &str) {
        warn!(
            event = "surge_orphan_adopted",
            controller = %self.controller,
            recommendation = %recommendation,
            surge = %surge,
            "Found surge workload without a pending rollout, resuming it"
        );
    }

    pub fn log_startup(&self, version: &str, namespace: Option<&str>) {
        info!(
            event = "controller_started",
            controller = %self.controller,
            version = %version,
            namespace = namespace.unwrap_or("<all>"),
            "Rollout controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller,
            reason = %reason,
            "Rollout controller shutting down"
        );
    }
}
