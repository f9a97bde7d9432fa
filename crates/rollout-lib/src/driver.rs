//! Reconciliation driver
//!
//! Lists every recommendation once, then follows changes through a watch
//! that resumes from the highest revision seen. The watch is reopened when
//! the store closes it (routinely, after the server-side timeout) or when it
//! fails; an expired resume point triggers a fresh listing instead. Events
//! are reconciled one at a time, in delivery order.

use crate::error::{Result, StoreError};
use crate::health::{ControllerHealth, DriverPhase};
use crate::models::Recommendation;
use crate::observability::ControllerMetrics;
use crate::rollout::RolloutEngine;
use crate::store::{revision_of, ResourceKind, ResourceStore, WatchEvent, WatchStream};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Restrict recommendations to one namespace; `None` watches all
    pub namespace: Option<String>,
    /// Server-side timeout of each watch request
    pub watch_timeout: Duration,
    /// Period of the full relist, independent of watch events
    pub resync_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            watch_timeout: Duration::from_secs(300),
            resync_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Handle to a running driver.
pub struct DriverHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    /// Stop the driver. Returns once the event in flight, if any, has been
    /// reconciled and the watch has been closed.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Reconciliation driver task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Why a watch stream stopped being consumed.
enum StreamEnd {
    Shutdown,
    /// Closed by the store, usually on timeout
    Closed,
    Expired,
    Failed(StoreError),
}

/// Higher of two revision tokens; non-numeric tokens are taken as newer.
fn later_revision(current: &str, candidate: &str) -> String {
    match (current.parse::<u64>(), candidate.parse::<u64>()) {
        (Ok(a), Ok(b)) if a >= b => current.to_string(),
        _ => candidate.to_string(),
    }
}

pub struct ReconciliationDriver {
    store: Arc<dyn ResourceStore>,
    engine: Arc<RolloutEngine>,
    config: DriverConfig,
    health: ControllerHealth,
    metrics: ControllerMetrics,
}

impl ReconciliationDriver {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        engine: Arc<RolloutEngine>,
        config: DriverConfig,
        health: ControllerHealth,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            health,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Reconcile every recommendation once, then spawn the watch loop.
    ///
    /// A failing initial listing is returned to the caller; later failures
    /// are retried by the loop.
    pub async fn start(self) -> Result<DriverHandle> {
        self.health.set_phase(DriverPhase::Starting).await;
        let resume = self.sync_all().await?;
        info!(resume_revision = %resume, "Initial reconciliation finished");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(resume, shutdown_rx));
        Ok(DriverHandle { shutdown_tx, task })
    }

    /// List and reconcile all recommendations. Returns the resume point:
    /// the highest item revision, or the list revision when empty.
    async fn sync_all(&self) -> Result<String> {
        let list = self
            .store
            .list(&ResourceKind::recommendations(), self.config.namespace.as_deref(), None)
            .await?;
        let count = list.items.len();

        let max_item = list.items.iter().filter_map(revision_of).max();
        let resume = match max_item {
            Some(revision) => revision.to_string(),
            None => list.resource_version.clone().unwrap_or_else(|| "0".to_string()),
        };

        for item in list.items {
            self.dispatch(item).await;
        }
        debug!(recommendations = count, resume_revision = %resume, "Listed recommendations");
        self.metrics.set_resume_revision(&resume);
        Ok(resume)
    }

    /// Reconcile one recommendation document. Failures stay local to it.
    async fn dispatch(&self, doc: Value) {
        let started = Instant::now();
        let rec = match Recommendation::from_document(doc) {
            Ok(rec) => rec,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable recommendation");
                self.metrics.inc_reconcile_errors(e.kind());
                return;
            }
        };

        match self.engine.reconcile(&rec).await {
            Ok(outcome) => {
                debug!(recommendation = %rec.key(), outcome = outcome.as_str(), "Reconciled");
                self.metrics
                    .observe_reconcile(started.elapsed().as_secs_f64(), outcome.as_str());
            }
            Err(e) => {
                warn!(recommendation = %rec.key(), error = %e, "Reconciliation failed");
                self.metrics.inc_reconcile_errors(e.kind());
                self.metrics
                    .observe_reconcile(started.elapsed().as_secs_f64(), "error");
            }
        }
    }

    async fn run(self, mut resume: String, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.initial_backoff;
        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial listing covers it.
        resync.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let stream = match self
                .store
                .watch(
                    &ResourceKind::recommendations(),
                    self.config.namespace.as_deref(),
                    &resume,
                    self.config.watch_timeout,
                )
                .await
            {
                Ok(stream) => {
                    backoff = self.config.initial_backoff;
                    self.health.record_watch_success().await;
                    self.health.set_phase(DriverPhase::Watching).await;
                    debug!(resume_revision = %resume, "Watch opened");
                    stream
                }
                Err(StoreError::Expired(reason)) => {
                    self.metrics.inc_watch_restarts("expired");
                    info!(reason = %reason, "Resume point expired, relisting");
                    if !self.relist(&mut resume, &mut shutdown, &mut backoff).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    self.metrics.inc_watch_restarts("error");
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "Failed to open watch");
                    self.health.record_watch_failure(e.to_string()).await;
                    if !self.back_off(&mut shutdown, &mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            match self
                .consume(stream, &mut resume, &mut shutdown, &mut resync)
                .await
            {
                StreamEnd::Shutdown => break,
                StreamEnd::Closed => {
                    self.metrics.inc_watch_restarts("closed");
                    debug!(resume_revision = %resume, "Watch closed by the store, reopening");
                }
                StreamEnd::Expired => {
                    self.metrics.inc_watch_restarts("expired");
                    info!("Resume point expired mid-stream, relisting");
                    if !self.relist(&mut resume, &mut shutdown, &mut backoff).await {
                        break;
                    }
                }
                StreamEnd::Failed(e) => {
                    self.metrics.inc_watch_restarts("error");
                    warn!(error = %e, "Watch failed, reopening");
                    self.health.record_watch_failure(e.to_string()).await;
                    if !self.back_off(&mut shutdown, &mut backoff).await {
                        break;
                    }
                }
            }
        }

        self.health.set_phase(DriverPhase::Stopped).await;
        info!("Reconciliation driver stopped");
    }

    /// Sleep for the current backoff, then double it. Returns false if
    /// shutdown was requested meanwhile.
    async fn back_off(&self, shutdown: &mut watch::Receiver<bool>, backoff: &mut Duration) -> bool {
        self.health.set_phase(DriverPhase::Reconnecting).await;
        let delay = *backoff;
        *backoff = (*backoff * 2).min(self.config.max_backoff);
        tokio::select! {
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn relist(
        &self,
        resume: &mut String,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> bool {
        match self.sync_all().await {
            Ok(revision) => {
                *resume = revision;
                true
            }
            Err(e) => {
                warn!(error = %e, "Relist failed");
                self.health.record_watch_failure(e.to_string()).await;
                self.back_off(shutdown, backoff).await
            }
        }
    }

    async fn consume(
        &self,
        mut stream: WatchStream,
        resume: &mut String,
        shutdown: &mut watch::Receiver<bool>,
        resync: &mut Interval,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => return StreamEnd::Shutdown,

                _ = resync.tick() => {
                    debug!("Periodic resync");
                    match self.sync_all().await {
                        Ok(revision) => *resume = later_revision(resume, &revision),
                        Err(e) => warn!(error = %e, "Periodic resync failed"),
                    }
                }

                next = stream.next() => match next {
                    None => return StreamEnd::Closed,
                    Some(Err(StoreError::Expired(_))) => return StreamEnd::Expired,
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    Some(Ok(event)) => {
                        self.health.record_event().await;
                        self.handle_event(event, resume).await;
                        self.metrics.set_resume_revision(resume);
                    }
                },
            }
        }
    }

    async fn handle_event(&self, event: WatchEvent, resume: &mut String) {
        match event {
            WatchEvent::Added(doc) | WatchEvent::Modified(doc) => {
                if let Some(revision) = revision_of(&doc) {
                    *resume = later_revision(resume, &revision.to_string());
                }
                self.dispatch(doc).await;
            }
            WatchEvent::Deleted(doc) => {
                if let Some(revision) = revision_of(&doc) {
                    *resume = later_revision(resume, &revision.to_string());
                }
                debug!("Ignoring deleted recommendation");
            }
            WatchEvent::Bookmark(revision) => {
                *resume = later_revision(resume, &revision);
            }
            WatchEvent::Error(message) => {
                warn!(error = %message, "Watch reported an error");
            }
        }
    }
}
