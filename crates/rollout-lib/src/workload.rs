//! Target workloads and the pods they own
//!
//! Pods are matched through the workload's `matchLabels` selector and then
//! partitioned by the surge marker label, so that a target and its surge
//! workload (which share a selector) never see each other's pods.

use crate::annotations::{RESTARTED_AT, SURGE_BUFFER_MARKER};
use crate::document::{PodTemplateWorkload, Workload};
use crate::error::{Result, RolloutError};
use crate::models::Recommendation;
use crate::store::{ResourceKind, ResourceStore};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, SubsecRound, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// Which of a selector's pods belong to the workload being inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodSet {
    /// Pods of the user-facing workload.
    Primary,
    /// Pods of the surge workload.
    Surge,
}

/// Equality-based label selector, as accepted by the list API.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<(String, bool, String)>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push((key.into(), true, value.into()));
        self
    }

    pub fn not_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push((key.into(), false, value.into()));
        self
    }

    /// An absent label satisfies a `!=` requirement, like the API server does.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|(key, equal, value)| {
            let actual = labels.get(key);
            if *equal {
                actual == Some(value)
            } else {
                actual != Some(value)
            }
        })
    }

    pub fn for_workload(workload: &Workload, set: PodSet) -> Result<Self> {
        let selector = workload
            .selector_labels()?
            .into_iter()
            .fold(Self::new(), |sel, (k, v)| sel.equals(k, v));
        Ok(match set {
            PodSet::Primary => selector.not_equals(SURGE_BUFFER_MARKER, "true"),
            PodSet::Surge => selector.equals(SURGE_BUFFER_MARKER, "true"),
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|(k, equal, v)| format!("{}{}{}", k, if *equal { "=" } else { "!=" }, v))
            .collect();
        write!(f, "{}", terms.join(","))
    }
}

/// Fetch the workload a recommendation points at.
pub async fn get_target_workload(store: &dyn ResourceStore, rec: &Recommendation) -> Result<Workload> {
    let doc = store
        .get(&rec.target.resource_kind(), &rec.target.namespace, &rec.target.name)
        .await?;
    Ok(Workload::new(doc))
}

/// List the pods owned by `workload`, restricted to `set`.
pub async fn owned_pods(store: &dyn ResourceStore, workload: &Workload, set: PodSet) -> Result<Vec<Pod>> {
    let selector = LabelSelector::for_workload(workload, set)?;
    let selector = selector.to_string();
    let list = store
        .list(&ResourceKind::pods(), Some(workload.namespace()?), Some(&selector))
        .await?;

    let pods = list
        .items
        .into_iter()
        .map(serde_json::from_value::<Pod>)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    debug!(
        workload = workload.name()?,
        selector = %selector,
        pods = pods.len(),
        "Listed workload pods"
    );
    Ok(pods)
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("<unnamed>")
}

pub fn pod_created_at(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// True when there is at least one pod, every pod is Running and every
/// container of every pod is ready.
pub fn pods_are_healthy(workload_name: &str, pods: &[Pod]) -> bool {
    if pods.is_empty() {
        info!(workload = workload_name, "No pods found for workload");
        return false;
    }

    for pod in pods {
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
        if phase != "Running" {
            info!(
                workload = workload_name,
                pod = pod_name(pod),
                phase = phase,
                "Pod is not running"
            );
            return false;
        }

        let statuses = status.and_then(|s| s.container_statuses.as_deref()).unwrap_or_default();
        if let Some(not_ready) = statuses.iter().find(|c| !c.ready) {
            info!(
                workload = workload_name,
                pod = pod_name(pod),
                container = %not_ready.name,
                "Pod container is not ready"
            );
            return false;
        }
    }
    true
}

pub async fn workload_is_healthy(store: &dyn ResourceStore, workload: &Workload, set: PodSet) -> Result<bool> {
    let pods = owned_pods(store, workload, set).await?;
    Ok(pods_are_healthy(workload.name()?, &pods))
}

/// Time of the last disruptive restart recorded on the pod template.
pub fn restarted_at(workload: &Workload) -> Result<Option<DateTime<Utc>>> {
    let annotations = workload.pod_template_annotations()?;
    match annotations.get(RESTARTED_AT) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| RolloutError::configuration(RESTARTED_AT, format!("'{}': {}", raw, e))),
    }
}

/// Whether every pod was created at or after `since`.
///
/// Timestamps have second granularity, so a pod created in the same second
/// as the restart counts as recreated.
pub fn all_pods_created_since(pods: &[Pod], since: DateTime<Utc>) -> bool {
    pods.iter().all(|pod| match pod_created_at(pod) {
        Some(created) => created >= since,
        None => false,
    })
}

/// Timestamp for the next restart: `now`, or one second past the previous
/// restart when the clock lags behind it.
pub fn next_restart_timestamp(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(0);
    match last {
        Some(last) if last + ChronoDuration::seconds(1) > now => last + ChronoDuration::seconds(1),
        _ => now,
    }
}

pub fn resource_kind_of(workload: &Workload) -> Result<ResourceKind> {
    Ok(ResourceKind::from_type(workload.api_version()?, workload.kind()?))
}

/// Trigger a rolling restart by merge-patching the pod template's restart
/// annotation. Returns the timestamp written.
pub async fn patch_restart_timestamp(
    store: &dyn ResourceStore,
    workload: &Workload,
    now: DateTime<Utc>,
    field_manager: &str,
) -> Result<DateTime<Utc>> {
    let at = next_restart_timestamp(restarted_at(workload)?, now);
    let patch = json!({
        "spec": {"template": {"metadata": {"annotations": {
            RESTARTED_AT: at.to_rfc3339_opts(SecondsFormat::Secs, true)
        }}}}
    });
    store
        .patch(
            &resource_kind_of(workload)?,
            workload.namespace()?,
            workload.name()?,
            &patch,
            field_manager,
        )
        .await?;
    Ok(at)
}
