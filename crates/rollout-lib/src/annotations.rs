//! Annotation vocabulary and per-recommendation overrides
//!
//! Recommendations carry their rollout configuration and their persisted
//! rollout state as string annotations. Overrides that are present but do
//! not parse are configuration errors, never silent fallbacks.

use crate::error::{Result, RolloutError};
use crate::models::Recommendation;
use crate::units::parse_duration;
use std::time::Duration;

/// Opts a recommendation in when set to "true".
pub const ENABLED: &str = "vpa-rollout.influxdata.io/enabled";

/// Overrides the cooldown between rollouts (Go duration syntax).
pub const COOLDOWN_PERIOD: &str = "vpa-rollout.influxdata.io/cooldown-period";

/// Overrides the divergence percentage that triggers a rollout.
pub const DIFF_PERCENT_TRIGGER: &str = "vpa-rollout.influxdata.io/diff-percent-trigger";

/// Selects the surge-buffer rollout path when set to "true".
pub const SURGE_BUFFER_ENABLED: &str = "vpa-rollout.influxdata.io/surge-buffer-enabled";

/// Replica count of the surge workload.
pub const NUMBER_OF_SURGE_BUFFER_PODS: &str = "vpa-rollout.influxdata.io/number-of-surge-buffer-pods";

/// Persisted rollout session state.
pub const ROLLOUT_STATUS: &str = "vpa-rollout.influxdata.io/rollout-status";

/// Marks surge workloads and their pods (annotation and label).
pub const SURGE_BUFFER_MARKER: &str = "vpa-rollout.influxdata.io/surge-buffer";

/// Pod template annotation written to trigger a restart.
pub const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

pub const DEFAULT_SURGE_BUFFER_REPLICAS: &str = "1";

/// Suffix appended to the target name to form the surge workload name.
pub const SURGE_BUFFER_SUFFIX: &str = "-surge-buffer";

/// Target restart timestamp recorded on the surge workload when it is
/// created; empty if the target had never been restarted.
pub const SURGE_RESTART_BASELINE: &str = "vpa-rollout.influxdata.io/target-restarted-at";

/// Annotations stamped on the surge workload and its pod template.
pub const SURGE_BUFFER_ANNOTATIONS: [(&str, &str); 3] = [
    (SURGE_BUFFER_MARKER, "true"),
    ("cluster-autoscaler.kubernetes.io/safe-to-evict", "false"),
    ("sidecar.istio.io/inject", "false"),
];

pub fn is_true(rec: &Recommendation, key: &str) -> bool {
    rec.annotations.get(key).map(String::as_str) == Some("true")
}

pub fn effective_cooldown(rec: &Recommendation, default: Duration) -> Result<Duration> {
    match rec.annotation(COOLDOWN_PERIOD) {
        Some(raw) => parse_duration(raw)
            .map_err(|e| RolloutError::configuration(COOLDOWN_PERIOD, e.to_string())),
        None => Ok(default),
    }
}

pub fn effective_diff_percent(rec: &Recommendation, default: u32) -> Result<u32> {
    match rec.annotation(DIFF_PERCENT_TRIGGER) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            RolloutError::configuration(
                DIFF_PERCENT_TRIGGER,
                format!("'{}' is not a non-negative integer", raw),
            )
        }),
        None => Ok(default),
    }
}

pub fn surge_replicas(rec: &Recommendation) -> Result<i64> {
    let raw = rec
        .annotation(NUMBER_OF_SURGE_BUFFER_PODS)
        .unwrap_or(DEFAULT_SURGE_BUFFER_REPLICAS);
    raw.trim()
        .parse::<u32>()
        .map(i64::from)
        .map_err(|_| {
            RolloutError::configuration(
                NUMBER_OF_SURGE_BUFFER_PODS,
                format!("'{}' is not a non-negative integer", raw),
            )
        })
}
