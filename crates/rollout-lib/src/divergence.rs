//! Recommendation versus live request comparison

use crate::annotations::effective_diff_percent;
use crate::document::Workload;
use crate::error::{Result, RolloutError};
use crate::models::Recommendation;
use crate::store::ResourceStore;
use crate::units::parse_quantity;
use crate::workload::{owned_pods, pods_are_healthy, PodSet};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

/// Quantities are decimal, so a percentage that is exactly at the threshold
/// can come out a few ulps above it.
const BOUNDARY_TOLERANCE: f64 = 1e-9;

/// Absolute difference between `live` and `target`, as a percentage of
/// `target`.
pub fn diff_percent(live: f64, target: f64) -> f64 {
    (live - target).abs() / target * 100.0
}

/// The first resource found to diverge past the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub container: String,
    pub resource: &'static str,
    pub live: f64,
    pub target: f64,
    pub percent: f64,
}

fn parse_target(container: &str, resource: &str, raw: &str) -> Result<f64> {
    parse_quantity(raw).map_err(|e| {
        RolloutError::Invariant(format!(
            "recommended {} for container {} is unusable: {}",
            resource, container, e
        ))
    })
}

fn live_request(pod: &Pod, container: &str, resource: &str) -> Result<Option<f64>> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(None);
    };
    let Some(live) = spec.containers.iter().find(|c| c.name == container) else {
        return Ok(None);
    };
    let raw = live
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get(resource));
    match raw {
        // No request at all reads as zero usage of the recommendation.
        None => Ok(Some(0.0)),
        Some(quantity) => parse_quantity(&quantity.0).map(Some).map_err(|e| {
            RolloutError::Invariant(format!(
                "live {} request of container {} is unusable: {}",
                resource, container, e
            ))
        }),
    }
}

/// Compare each complete container recommendation with the requests of
/// `pod`. The first container whose cpu or memory diverges strictly more
/// than `threshold` percent wins.
pub fn first_divergence(rec: &Recommendation, pod: &Pod, threshold: u32) -> Result<Option<Divergence>> {
    let threshold = f64::from(threshold);
    for container in rec.complete_containers() {
        let Some((cpu, memory)) = container.complete_targets() else {
            continue;
        };
        let name = container.container_name.as_str();

        for (resource, target) in [("cpu", cpu), ("memory", memory)] {
            let target = parse_target(name, resource, &target.0)?;
            if target <= 0.0 {
                continue;
            }
            let Some(live) = live_request(pod, name, resource)? else {
                debug!(container = name, "Container not present in pod, skipping");
                break;
            };
            let percent = diff_percent(live, target);
            if percent - threshold > BOUNDARY_TOLERANCE {
                return Ok(Some(Divergence {
                    container: name.to_string(),
                    resource,
                    live,
                    target,
                    percent,
                }));
            }
        }
    }
    Ok(None)
}

/// Whether the target's live requests diverge enough from the
/// recommendation to warrant a rollout. An unhealthy workload never needs
/// one.
pub async fn rollout_is_needed(
    store: &dyn ResourceStore,
    rec: &Recommendation,
    target: &Workload,
    default_threshold: u32,
) -> Result<bool> {
    let pods = owned_pods(store, target, PodSet::Primary).await?;
    if !pods_are_healthy(target.name()?, &pods) {
        info!(recommendation = %rec.key(), "Target workload is not healthy, not rolling out");
        return Ok(false);
    }

    let threshold = effective_diff_percent(rec, default_threshold)?;
    let Some(representative) = pods.first() else {
        return Ok(false);
    };

    match first_divergence(rec, representative, threshold)? {
        Some(found) => {
            info!(
                recommendation = %rec.key(),
                container = %found.container,
                resource = found.resource,
                live = found.live,
                target = found.target,
                diff_percent = found.percent,
                threshold_percent = threshold,
                "Live requests diverge from recommendation"
            );
            Ok(true)
        }
        None => {
            debug!(
                recommendation = %rec.key(),
                threshold_percent = threshold,
                "Live requests are within threshold"
            );
            Ok(false)
        }
    }
}
