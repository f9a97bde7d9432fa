//! The rollout state machine
//!
//! Each call to [`RolloutEngine::reconcile`] advances one recommendation by
//! at most one step, starting from the status persisted on it:
//!
//! - Stable / Complete: if eligible, out of cooldown and diverging, either
//!   restart the target directly or create a surge workload and go Pending.
//! - Pending: once the surge workload is ready, restart the target and go
//!   InProgress.
//! - InProgress: once the target is healthy and fully recreated, remove the
//!   surge workload and go Complete.
//!
//! Every step starts by re-reading the recommendation and its target from
//! the store, so stale or duplicate events are harmless and a step that
//! failed halfway is simply evaluated again on the next cycle.

use crate::annotations::{is_true, surge_replicas, ROLLOUT_STATUS, SURGE_BUFFER_ENABLED};
use crate::clock::{Clock, SystemClock};
use crate::cooldown::cooldown_elapsed;
use crate::divergence::rollout_is_needed;
use crate::document::Workload;
use crate::eligibility::is_eligible;
use crate::error::{Result, StoreError};
use crate::models::{Recommendation, RolloutStatus};
use crate::observability::{ControllerMetrics, RolloutLogger};
use crate::store::{ResourceKind, ResourceStore};
use crate::surge::{
    create_surge_workload, delete_surge_workload, get_surge_workload, restarted_since_surge,
    surge_exists, surge_name, surge_workload_status, SurgeStatus,
};
use crate::workload::{
    all_pods_created_since, get_target_workload, owned_pods, patch_restart_timestamp,
    pods_are_healthy, restarted_at, PodSet,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Settings shared by every reconciliation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Divergence percentage above which a rollout is triggered
    pub diff_percent_trigger: u32,
    /// Minimum time between two rollouts of the same workload
    pub cooldown_period: Duration,
    /// Author of every patch
    pub field_manager: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            diff_percent_trigger: 10,
            cooldown_period: Duration::from_secs(15 * 60),
            field_manager: "flux-client-side-apply".to_string(),
        }
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not managed by this controller
    Ineligible,
    /// Nothing to do this cycle
    Idle,
    /// The target was restarted directly, no session recorded
    Restarted,
    Transitioned { from: RolloutStatus, to: RolloutStatus },
}

impl Outcome {
    /// Label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ineligible => "ineligible",
            Outcome::Idle => "idle",
            Outcome::Restarted => "restarted",
            Outcome::Transitioned { .. } => "transitioned",
        }
    }
}

pub struct RolloutEngine {
    store: Arc<dyn ResourceStore>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    metrics: ControllerMetrics,
    logger: RolloutLogger,
}

impl RolloutEngine {
    pub fn new(store: Arc<dyn ResourceStore>, config: EngineConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn ResourceStore>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            metrics: ControllerMetrics::new(),
            logger: RolloutLogger::new(crate::CONTROLLER_NAME),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance the recommendation identified by `rec` by one step.
    pub async fn reconcile(&self, rec: &Recommendation) -> Result<Outcome> {
        let current = match self
            .store
            .get(&ResourceKind::recommendations(), &rec.namespace, &rec.name)
            .await
        {
            Ok(doc) => Recommendation::from_document(doc)?,
            Err(StoreError::NotFound(_)) => {
                debug!(recommendation = %rec.key(), "Recommendation no longer exists");
                return Ok(Outcome::Idle);
            }
            Err(e) => return Err(e.into()),
        };
        let rec = &current;

        let status = rec.rollout_status()?;
        debug!(recommendation = %rec.key(), status = ?status, "Reconciling recommendation");

        match status {
            RolloutStatus::Stable | RolloutStatus::Complete => self.evaluate(rec, status).await,
            RolloutStatus::Pending => self.advance_pending(rec).await,
            RolloutStatus::InProgress => self.advance_in_progress(rec).await,
        }
    }

    async fn evaluate(&self, rec: &Recommendation, status: RolloutStatus) -> Result<Outcome> {
        if !is_eligible(rec) {
            return Ok(Outcome::Ineligible);
        }
        let store = self.store.as_ref();
        let target = get_target_workload(store, rec).await?;

        // A surge workload without a session means the status write after
        // creating it was lost.
        if surge_exists(store, &target).await? {
            self.logger.log_orphan_adopted(&rec.key(), &surge_name(target.name()?));
            return self.set_status(rec, status, RolloutStatus::Pending).await;
        }

        if !cooldown_elapsed(store, rec, &target, self.config.cooldown_period, self.clock.as_ref()).await? {
            return Ok(Outcome::Idle);
        }
        if !rollout_is_needed(store, rec, &target, self.config.diff_percent_trigger).await? {
            return Ok(Outcome::Idle);
        }

        if is_true(rec, SURGE_BUFFER_ENABLED) {
            self.logger
                .log_rollout_triggered(&rec.key(), &rec.target.to_string(), "surge");
            self.metrics.inc_rollouts_triggered("surge");
            create_surge_workload(store, rec, &target).await?;
            self.metrics.inc_surge_created();
            self.logger
                .log_surge_created(&rec.key(), &surge_name(target.name()?), surge_replicas(rec)?);
            self.set_status(rec, status, RolloutStatus::Pending).await
        } else {
            self.logger
                .log_rollout_triggered(&rec.key(), &rec.target.to_string(), "direct");
            self.metrics.inc_rollouts_triggered("direct");
            self.restart(rec, &target).await?;
            Ok(Outcome::Restarted)
        }
    }

    async fn advance_pending(&self, rec: &Recommendation) -> Result<Outcome> {
        let store = self.store.as_ref();
        let target = get_target_workload(store, rec).await?;

        // The restart went through but the status write after it did not.
        if let Some(surge) = get_surge_workload(store, &target).await? {
            if restarted_since_surge(&surge, &target)? {
                debug!(recommendation = %rec.key(), "Target already restarted in this session");
                return self
                    .set_status(rec, RolloutStatus::Pending, RolloutStatus::InProgress)
                    .await;
            }
        }

        match surge_workload_status(store, &target).await? {
            SurgeStatus::Ready => {
                self.restart(rec, &target).await?;
                self.set_status(rec, RolloutStatus::Pending, RolloutStatus::InProgress)
                    .await
            }
            SurgeStatus::NotReady | SurgeStatus::NotFound => Ok(Outcome::Idle),
        }
    }

    async fn advance_in_progress(&self, rec: &Recommendation) -> Result<Outcome> {
        let store = self.store.as_ref();
        let target = get_target_workload(store, rec).await?;

        let pods = owned_pods(store, &target, PodSet::Primary).await?;
        if !pods_are_healthy(target.name()?, &pods) {
            return Ok(Outcome::Idle);
        }
        if let Some(restart) = restarted_at(&target)? {
            if !all_pods_created_since(&pods, restart) {
                debug!(recommendation = %rec.key(), "Waiting for pods to be recreated");
                return Ok(Outcome::Idle);
            }
        }

        if surge_exists(store, &target).await? {
            let existed = delete_surge_workload(store, &target).await?;
            if existed {
                self.metrics.inc_surge_deleted();
            }
            self.logger
                .log_surge_deleted(&rec.key(), &surge_name(target.name()?), existed);
        }
        self.set_status(rec, RolloutStatus::InProgress, RolloutStatus::Complete)
            .await
    }

    async fn restart(&self, rec: &Recommendation, target: &Workload) -> Result<()> {
        let at = patch_restart_timestamp(
            self.store.as_ref(),
            target,
            self.clock.now(),
            &self.config.field_manager,
        )
        .await?;
        self.logger
            .log_restart(&rec.key(), &rec.target.to_string(), &at.to_rfc3339());
        Ok(())
    }

    async fn set_status(&self, rec: &Recommendation, from: RolloutStatus, to: RolloutStatus) -> Result<Outcome> {
        let patch = json!({"metadata": {"annotations": {ROLLOUT_STATUS: to.as_str()}}});
        self.store
            .patch(
                &ResourceKind::recommendations(),
                &rec.namespace,
                &rec.name,
                &patch,
                &self.config.field_manager,
            )
            .await?;
        self.metrics.inc_status_transitions(to);
        self.logger.log_status_transition(&rec.key(), from, to);
        Ok(Outcome::Transitioned { from, to })
    }
}
