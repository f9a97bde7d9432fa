//! Rate limiting of disruptive restarts
//!
//! A workload is out of cooldown when none of its pods is younger than the
//! cooldown period and its last recorded restart is at least that old. The
//! pod-age check runs first: a restart timestamp can be written before the
//! new pods exist.

use crate::annotations::{effective_cooldown, COOLDOWN_PERIOD};
use crate::clock::Clock;
use crate::document::Workload;
use crate::error::{Result, RolloutError};
use crate::models::Recommendation;
use crate::store::ResourceStore;
use crate::workload::{owned_pods, pod_created_at, pod_name, restarted_at, PodSet};
use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tracing::debug;

pub async fn cooldown_elapsed(
    store: &dyn ResourceStore,
    rec: &Recommendation,
    target: &Workload,
    default_period: Duration,
    clock: &dyn Clock,
) -> Result<bool> {
    let period = effective_cooldown(rec, default_period)?;
    let period = ChronoDuration::from_std(period)
        .map_err(|e| RolloutError::configuration(COOLDOWN_PERIOD, e.to_string()))?;
    let now = clock.now();

    let pods = owned_pods(store, target, PodSet::Primary).await?;
    if pods.is_empty() {
        debug!(recommendation = %rec.key(), "Cooldown not elapsed: no pods yet");
        return Ok(false);
    }

    for pod in &pods {
        // A pod without a creation time is treated as brand new.
        let age = pod_created_at(pod).map(|created| now - created);
        if age.map_or(true, |age| age < period) {
            debug!(
                recommendation = %rec.key(),
                pod = pod_name(pod),
                age_secs = ?age.map(|a| a.num_seconds()),
                "Cooldown not elapsed: pod is younger than the cooldown period"
            );
            return Ok(false);
        }
    }

    match restarted_at(target)? {
        None => Ok(true),
        Some(last) => {
            let elapsed = now - last;
            debug!(
                recommendation = %rec.key(),
                last_restart = %last,
                elapsed_secs = elapsed.num_seconds(),
                period_secs = period.num_seconds(),
                "Evaluated cooldown"
            );
            Ok(elapsed >= period)
        }
    }
}
