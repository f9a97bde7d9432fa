//! Test doubles and fixtures shared by the unit and scenario tests

use crate::annotations::{ENABLED, RESTARTED_AT, ROLLOUT_STATUS, SURGE_BUFFER_MARKER};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::models::{Recommendation, RolloutStatus};
use crate::store::{ObjectList, ResourceKind, ResourceStore, WatchEvent, WatchStream};
use crate::workload::LabelSelector;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Reference instant most fixtures are positioned against.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// A clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn parse_selector(raw: &str) -> LabelSelector {
    raw.split(',')
        .filter(|term| !term.is_empty())
        .fold(LabelSelector::new(), |sel, term| {
            if let Some((k, v)) = term.split_once("!=") {
                sel.not_equals(k, v)
            } else {
                let (k, v) = term.split_once('=').unwrap();
                sel.equals(k, v)
            }
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Patch,
    Create,
    Delete,
    Watch,
}

/// A successful write, as observed by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Patch { plural: String, name: String, patch: Value },
    Create { plural: String, name: String },
    Delete { plural: String, name: String },
}

impl Mutation {
    pub fn plural(&self) -> &str {
        match self {
            Mutation::Patch { plural, .. }
            | Mutation::Create { plural, .. }
            | Mutation::Delete { plural, .. } => plural,
        }
    }
}

type WatchSession = Result<Vec<Result<WatchEvent, StoreError>>, StoreError>;

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<(String, String, String), Value>,
    revision: u64,
    mutations: Vec<Mutation>,
    failures: Vec<(Op, String, StoreError)>,
    watch_sessions: VecDeque<WatchSession>,
    watch_resume_versions: Vec<String>,
    list_calls: BTreeMap<String, usize>,
}

impl StoreState {
    fn take_failure(&mut self, op: Op, kind: &ResourceKind) -> Result<(), StoreError> {
        match self
            .failures
            .iter()
            .position(|(o, plural, _)| *o == op && *plural == kind.plural)
        {
            Some(index) => Err(self.failures.remove(index).2),
            None => Ok(()),
        }
    }

    fn stamp(&mut self, doc: &mut Value) {
        self.revision += 1;
        merge_patch(
            doc,
            &json!({"metadata": {"resourceVersion": self.revision.to_string()}}),
        );
    }
}

fn key_of(kind: &ResourceKind, namespace: &str, name: &str) -> (String, String, String) {
    (kind.plural.clone(), namespace.to_string(), name.to_string())
}

/// In-memory [`ResourceStore`] with failure injection and scripted watches.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a mutation.
    pub fn insert(&self, kind: &ResourceKind, mut doc: Value) -> Value {
        let mut state = self.state.lock().unwrap();
        let namespace = doc["metadata"]["namespace"].as_str().unwrap_or("default").to_string();
        let name = doc["metadata"]["name"].as_str().unwrap().to_string();
        merge_patch(&mut doc, &json!({"metadata": {"namespace": namespace}}));
        state.stamp(&mut doc);
        state.objects.insert(key_of(kind, &namespace, &name), doc.clone());
        doc
    }

    /// Drop an object without recording a mutation.
    pub fn remove(&self, kind: &ResourceKind, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(&key_of(kind, namespace, name));
    }

    pub fn object(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state.objects.get(&key_of(kind, namespace, name)).cloned()
    }

    pub fn names(&self, kind: &ResourceKind) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .keys()
            .filter(|(plural, _, _)| *plural == kind.plural)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state.lock().unwrap().mutations.clear();
    }

    /// Make the next `op` against `kind` fail with `err`.
    pub fn fail_next(&self, op: Op, kind: &ResourceKind, err: StoreError) {
        let mut state = self.state.lock().unwrap();
        state.failures.push((op, kind.plural.clone(), err));
    }

    /// Queue a watch session that yields `events` and then ends.
    pub fn push_watch_session(&self, events: Vec<Result<WatchEvent, StoreError>>) {
        self.state.lock().unwrap().watch_sessions.push_back(Ok(events));
    }

    /// Queue a watch request that is rejected outright.
    pub fn push_watch_rejection(&self, err: StoreError) {
        self.state.lock().unwrap().watch_sessions.push_back(Err(err));
    }

    pub fn watch_resume_versions(&self) -> Vec<String> {
        self.state.lock().unwrap().watch_resume_versions.clone()
    }

    pub fn list_calls(&self, kind: &ResourceKind) -> usize {
        let state = self.state.lock().unwrap();
        state.list_calls.get(&kind.plural).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<Value, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(Op::Get, kind)?;
        state
            .objects
            .get(&key_of(kind, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", kind.plural, namespace, name)))
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(Op::List, kind)?;
        *state.list_calls.entry(kind.plural.clone()).or_default() += 1;

        let selector = label_selector.map(parse_selector);
        let items = state
            .objects
            .iter()
            .filter(|((plural, ns, _), _)| *plural == kind.plural && namespace.map_or(true, |n| n == ns.as_str()))
            .filter(|(_, doc)| {
                let labels: BTreeMap<String, String> =
                    serde_json::from_value(doc["metadata"]["labels"].clone()).unwrap_or_default();
                selector.as_ref().map_or(true, |s| s.matches(&labels))
            })
            .map(|(_, doc)| doc.clone())
            .collect();
        Ok(ObjectList {
            items,
            resource_version: Some(state.revision.to_string()),
        })
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        merge: &Value,
        _field_manager: &str,
    ) -> Result<Value, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(Op::Patch, kind)?;
        let key = key_of(kind, namespace, name);
        let mut doc = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", kind.plural, namespace, name)))?;
        merge_patch(&mut doc, merge);
        state.stamp(&mut doc);
        state.objects.insert(key, doc.clone());
        state.mutations.push(Mutation::Patch {
            plural: kind.plural.clone(),
            name: name.to_string(),
            patch: merge.clone(),
        });
        Ok(doc)
    }

    async fn create(&self, kind: &ResourceKind, namespace: &str, doc: &Value) -> Result<Value, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(Op::Create, kind)?;
        let name = doc["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let key = key_of(kind, namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} {}/{} already exists", kind.plural, namespace, name)));
        }
        let mut doc = doc.clone();
        state.stamp(&mut doc);
        state.objects.insert(key, doc.clone());
        state.mutations.push(Mutation::Create {
            plural: kind.plural.clone(),
            name,
        });
        Ok(doc)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(Op::Delete, kind)?;
        state
            .objects
            .remove(&key_of(kind, namespace, name))
            .ok_or_else(|| StoreError::NotFound(format!("{} {}/{}", kind.plural, namespace, name)))?;
        state.mutations.push(Mutation::Delete {
            plural: kind.plural.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        _namespace: Option<&str>,
        resume_version: &str,
        _timeout: Duration,
    ) -> Result<WatchStream, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(Op::Watch, kind)?;
        state.watch_resume_versions.push(resume_version.to_string());
        match state.watch_sessions.pop_front() {
            Some(Ok(events)) => Ok(Box::pin(tokio_stream::iter(events))),
            Some(Err(err)) => Err(err),
            // Script exhausted: park until shutdown.
            None => Ok(Box::pin(tokio_stream::pending::<Result<WatchEvent, StoreError>>())),
        }
    }
}

/// Builder for VerticalPodAutoscaler documents.
pub struct RecommendationBuilder {
    name: String,
    namespace: String,
    target: String,
    update_mode: Option<String>,
    annotations: BTreeMap<String, String>,
    targets: Vec<Value>,
    resource_version: String,
}

/// A recommendation for the Deployment `target`, in update mode "Initial",
/// recommending the same sizing the [`deployment`] fixture runs with.
pub fn recommendation(target: &str) -> RecommendationBuilder {
    RecommendationBuilder {
        name: format!("{}-vpa", target),
        namespace: "default".to_string(),
        target: target.to_string(),
        update_mode: Some("Initial".to_string()),
        annotations: BTreeMap::new(),
        targets: vec![json!({"containerName": "app", "target": {"cpu": "100m", "memory": "128Mi"}})],
        resource_version: "1".to_string(),
    }
}

impl RecommendationBuilder {
    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Opt in to the engine.
    pub fn enabled(self) -> Self {
        self.annotation(ENABLED, "true")
    }

    pub fn status(self, status: RolloutStatus) -> Self {
        self.annotation(ROLLOUT_STATUS, status.as_str())
    }

    pub fn update_mode(mut self, mode: Option<&str>) -> Self {
        self.update_mode = mode.map(str::to_string);
        self
    }

    pub fn resource_version(mut self, version: &str) -> Self {
        self.resource_version = version.to_string();
        self
    }

    /// Replace the container targets; `None` leaves the resource out.
    pub fn target(mut self, container: &str, cpu: Option<&str>, memory: Option<&str>) -> Self {
        self.targets.retain(|t| t["containerName"] != container);
        let mut target = Map::new();
        if let Some(cpu) = cpu {
            target.insert("cpu".into(), json!(cpu));
        }
        if let Some(memory) = memory {
            target.insert("memory".into(), json!(memory));
        }
        self.targets.push(json!({"containerName": container, "target": target}));
        self
    }

    pub fn without_targets(mut self) -> Self {
        self.targets.clear();
        self
    }

    pub fn document(&self) -> Value {
        let mut spec = json!({
            "targetRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": self.target}
        });
        if let Some(mode) = &self.update_mode {
            spec["updatePolicy"] = json!({"updateMode": mode});
        }
        json!({
            "apiVersion": "autoscaling.k8s.io/v1",
            "kind": "VerticalPodAutoscaler",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "resourceVersion": self.resource_version,
                "annotations": self.annotations,
            },
            "spec": spec,
            "status": {"recommendation": {"containerRecommendations": self.targets}},
        })
    }

    pub fn build(&self) -> Recommendation {
        Recommendation::from_document(self.document()).unwrap()
    }
}

/// Builder for Deployment documents.
pub struct DeploymentBuilder {
    name: String,
    replicas: i64,
    containers: Vec<(String, String, String)>,
    restarted_at: Option<String>,
}

/// A Deployment selecting `app=<name>` with a single container "app"
/// requesting 100m cpu and 128Mi memory.
pub fn deployment(name: &str) -> DeploymentBuilder {
    DeploymentBuilder {
        name: name.to_string(),
        replicas: 2,
        containers: vec![("app".into(), "100m".into(), "128Mi".into())],
        restarted_at: None,
    }
}

impl DeploymentBuilder {
    pub fn replicas(mut self, replicas: i64) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn container(mut self, name: &str, cpu: &str, memory: &str) -> Self {
        self.containers.retain(|(n, _, _)| n != name);
        self.containers.push((name.into(), cpu.into(), memory.into()));
        self
    }

    pub fn restarted_at(mut self, timestamp: &str) -> Self {
        self.restarted_at = Some(timestamp.to_string());
        self
    }

    pub fn build(&self) -> Value {
        let containers: Vec<Value> = self
            .containers
            .iter()
            .map(|(name, cpu, memory)| {
                json!({
                    "name": name,
                    "image": format!("{}:latest", name),
                    "resources": {
                        "requests": {"cpu": cpu, "memory": memory},
                        "limits": {"cpu": "1", "memory": memory},
                    },
                })
            })
            .collect();
        let mut template_annotations = Map::new();
        if let Some(ts) = &self.restarted_at {
            template_annotations.insert(RESTARTED_AT.into(), json!(ts));
        }
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": self.name,
                "namespace": "default",
                "labels": {"app": self.name},
                "annotations": {"deployment.kubernetes.io/revision": "3"},
            },
            "spec": {
                "replicas": self.replicas,
                "selector": {"matchLabels": {"app": self.name}},
                "template": {
                    "metadata": {"labels": {"app": self.name}, "annotations": template_annotations},
                    "spec": {"containers": containers},
                },
            },
            "status": {"replicas": self.replicas, "readyReplicas": self.replicas},
        })
    }
}

/// Builder for Pod documents.
pub struct PodBuilder {
    name: String,
    app: String,
    surge: bool,
    phase: String,
    ready: bool,
    created_at: DateTime<Utc>,
    containers: Vec<(String, Option<String>, Option<String>)>,
}

/// A running, ready pod labelled `app=<app>`, created two hours before
/// [`t0`], whose container "app" requests 100m cpu and 128Mi memory.
pub fn pod(name: &str, app: &str) -> PodBuilder {
    PodBuilder {
        name: name.to_string(),
        app: app.to_string(),
        surge: false,
        phase: "Running".to_string(),
        ready: true,
        created_at: t0() - ChronoDuration::hours(2),
        containers: vec![("app".into(), Some("100m".into()), Some("128Mi".into()))],
    }
}

impl PodBuilder {
    pub fn surge(mut self) -> Self {
        self.surge = true;
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Replace the requests of container `name`; `None` omits the resource.
    pub fn requests(mut self, name: &str, cpu: Option<&str>, memory: Option<&str>) -> Self {
        self.containers.retain(|(n, _, _)| n != name);
        self.containers
            .push((name.into(), cpu.map(str::to_string), memory.map(str::to_string)));
        self
    }

    pub fn build(&self) -> Value {
        let mut labels = Map::new();
        labels.insert("app".into(), json!(self.app));
        if self.surge {
            labels.insert(SURGE_BUFFER_MARKER.into(), json!("true"));
        }
        let containers: Vec<Value> = self
            .containers
            .iter()
            .map(|(name, cpu, memory)| {
                let mut requests = Map::new();
                if let Some(cpu) = cpu {
                    requests.insert("cpu".into(), json!(cpu));
                }
                if let Some(memory) = memory {
                    requests.insert("memory".into(), json!(memory));
                }
                json!({"name": name, "image": format!("{}:latest", name), "resources": {"requests": requests}})
            })
            .collect();
        let statuses: Vec<Value> = self
            .containers
            .iter()
            .map(|(name, _, _)| {
                json!({
                    "name": name,
                    "image": format!("{}:latest", name),
                    "imageID": "",
                    "ready": self.ready,
                    "restartCount": 0,
                })
            })
            .collect();
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.name,
                "namespace": "default",
                "labels": labels,
                "creationTimestamp": rfc3339(self.created_at),
            },
            "spec": {"containers": containers},
            "status": {"phase": self.phase, "containerStatuses": statuses},
        })
    }
}
