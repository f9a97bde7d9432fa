//! Core data models for the rollout controller

use crate::error::{Result, RolloutError};
use crate::store::ResourceKind;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Sizing guidance for a workload, as published by the upstream recommender
/// (a VerticalPodAutoscaler object).
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
    pub update_mode: Option<String>,
    pub target: TargetRef,
    pub containers: Vec<ContainerRecommendation>,
    pub resource_version: Option<String>,
}

/// Reference to the workload a recommendation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Recommended targets for one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecommendation {
    pub container_name: String,
    pub cpu: Option<Quantity>,
    pub memory: Option<Quantity>,
}

impl ContainerRecommendation {
    /// Both cpu and memory targets, when the recommender produced both.
    pub fn complete_targets(&self) -> Option<(&Quantity, &Quantity)> {
        match (&self.cpu, &self.memory) {
            (Some(cpu), Some(memory)) => Some((cpu, memory)),
            _ => None,
        }
    }
}

/// Persisted state of a rollout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RolloutStatus {
    Stable,
    Pending,
    InProgress,
    Complete,
}

impl RolloutStatus {
    /// Annotation value written for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::Stable => "",
            RolloutStatus::Pending => "pending",
            RolloutStatus::InProgress => "in-progress",
            RolloutStatus::Complete => "complete",
        }
    }

    /// Whether a surge workload is expected to exist in this state.
    pub fn in_flight(&self) -> bool {
        matches!(self, RolloutStatus::Pending | RolloutStatus::InProgress)
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutStatus::Stable => write!(f, "stable"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl FromStr for RolloutStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(RolloutStatus::Stable),
            "pending" => Ok(RolloutStatus::Pending),
            "in-progress" => Ok(RolloutStatus::InProgress),
            "complete" => Ok(RolloutStatus::Complete),
            other => Err(format!("unknown rollout status '{}'", other)),
        }
    }
}

// Wire shape of the VerticalPodAutoscaler object, reduced to what the
// controller reads.

#[derive(Debug, Deserialize)]
struct VpaDocument {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: VpaSpec,
    #[serde(default)]
    status: Option<VpaStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaSpec {
    target_ref: Option<VpaTargetRef>,
    update_policy: Option<VpaUpdatePolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaTargetRef {
    #[serde(default)]
    api_version: String,
    kind: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaUpdatePolicy {
    update_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VpaStatus {
    recommendation: Option<VpaRecommendation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaRecommendation {
    #[serde(default)]
    container_recommendations: Vec<VpaContainerRecommendation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaContainerRecommendation {
    container_name: String,
    #[serde(default)]
    target: BTreeMap<String, Quantity>,
}

impl Recommendation {
    /// Decode a recommendation from its raw store document.
    pub fn from_document(doc: Value) -> Result<Self> {
        let vpa: VpaDocument = serde_json::from_value(doc)?;

        let name = vpa
            .metadata
            .name
            .ok_or_else(|| RolloutError::Invariant("recommendation without a name".into()))?;
        let namespace = vpa.metadata.namespace.unwrap_or_else(|| "default".to_string());
        let target_ref = vpa.spec.target_ref.ok_or_else(|| {
            RolloutError::Invariant(format!("recommendation {}/{} has no targetRef", namespace, name))
        })?;

        let containers = vpa
            .status
            .and_then(|s| s.recommendation)
            .map(|r| r.container_recommendations)
            .unwrap_or_default()
            .into_iter()
            .map(|mut c| ContainerRecommendation {
                cpu: c.target.remove("cpu"),
                memory: c.target.remove("memory"),
                container_name: c.container_name,
            })
            .collect();

        Ok(Self {
            target: TargetRef {
                api_version: target_ref.api_version,
                kind: target_ref.kind,
                namespace: namespace.clone(),
                name: target_ref.name,
            },
            update_mode: vpa.spec.update_policy.and_then(|p| p.update_mode),
            annotations: vpa.metadata.annotations.unwrap_or_default(),
            resource_version: vpa.metadata.resource_version,
            containers,
            name,
            namespace,
        })
    }

    /// `namespace/name`, used as the reconciliation key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Non-empty annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn rollout_status(&self) -> Result<RolloutStatus> {
        let key = crate::annotations::ROLLOUT_STATUS;
        self.annotations
            .get(key)
            .map(|v| v.parse())
            .unwrap_or(Ok(RolloutStatus::Stable))
            .map_err(|reason| RolloutError::configuration(key, reason))
    }

    /// Container recommendations that carry both a cpu and a memory target.
    pub fn complete_containers(&self) -> impl Iterator<Item = &ContainerRecommendation> {
        self.containers
            .iter()
            .filter(|c| c.complete_targets().is_some())
    }

    /// The revision token as an integer, if it is one.
    pub fn revision(&self) -> Option<u64> {
        self.resource_version.as_deref().and_then(|v| v.parse().ok())
    }
}

impl TargetRef {
    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::from_type(&self.api_version, &self.kind)
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}
