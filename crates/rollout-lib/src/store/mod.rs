//! Resource store seam
//!
//! The engine never talks to the cluster directly. Every read and write
//! goes through [`ResourceStore`], which addresses resources by
//! (group, version, kind, plural, namespace, name) and exchanges them as raw
//! JSON documents so that any workload kind can be handled.

mod kube_store;

pub use kube_store::KubeStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

/// Type coordinates of a resource collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    /// VerticalPodAutoscaler objects.
    pub fn recommendations() -> Self {
        Self::new("autoscaling.k8s.io", "v1", "VerticalPodAutoscaler", "verticalpodautoscalers")
    }

    pub fn pods() -> Self {
        Self::new("", "v1", "Pod", "pods")
    }

    /// Derive the collection from an `apiVersion` and `kind` pair.
    ///
    /// `apps/v1` splits into group and version; a bare `v1` is the core group.
    /// The plural is the lower-cased kind with an `s` appended.
    pub fn from_type(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        Self::new(group, version, kind, &format!("{}s", kind.to_lowercase()))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.plural, self.version)
        } else {
            write!(f, "{}.{}.{}", self.plural, self.version, self.group)
        }
    }
}

/// Result of a list call.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<Value>,
    /// Revision of the collection as a whole, when the store reports one.
    pub resource_version: Option<String>,
}

/// One change delivered by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// Progress marker carrying only a revision.
    Bookmark(String),
    /// Stream-level error reported in-band by the store.
    Error(String),
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, StoreError>> + Send>>;

/// CRUD and watch operations the engine consumes.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str)
        -> Result<Value, StoreError>;

    /// List a collection; `namespace: None` lists across all namespaces.
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList, StoreError>;

    /// Apply a JSON merge patch on behalf of `field_manager`.
    async fn patch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        merge_patch: &Value,
        field_manager: &str,
    ) -> Result<Value, StoreError>;

    async fn create(&self, kind: &ResourceKind, namespace: &str, doc: &Value)
        -> Result<Value, StoreError>;

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str)
        -> Result<(), StoreError>;

    /// Open a watch starting after `resume_version`; the store ends the
    /// stream on its own after roughly `timeout`.
    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        resume_version: &str,
        timeout: Duration,
    ) -> Result<WatchStream, StoreError>;
}

/// Revision token of a document, if it is an integer.
pub fn revision_of(doc: &Value) -> Option<u64> {
    doc.get("metadata")?
        .get("resourceVersion")?
        .as_str()?
        .parse()
        .ok()
}
