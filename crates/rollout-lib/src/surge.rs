//! Surge buffer workloads
//!
//! A surge workload is a temporary copy of the target, sized to the
//! recommendation, that keeps capacity available while the target's pods
//! are restarted. It shares the target's selector; its pods are told apart
//! by the surge marker label.

use crate::annotations::{
    surge_replicas, RESTARTED_AT, SURGE_BUFFER_ANNOTATIONS, SURGE_BUFFER_MARKER,
    SURGE_BUFFER_SUFFIX, SURGE_RESTART_BASELINE,
};
use crate::document::{
    ensure_map, get_path, get_str, get_string_map, set_container_resource, PodTemplateWorkload,
    ResourceSlot, Workload,
};
use crate::error::{Result, RolloutError, StoreError};
use crate::models::Recommendation;
use crate::store::ResourceStore;
use crate::workload::{resource_kind_of, restarted_at, workload_is_healthy, PodSet};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Observed state of a target's surge workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurgeStatus {
    Ready,
    NotReady,
    NotFound,
}

impl SurgeStatus {
    pub fn exists(&self) -> bool {
        !matches!(self, SurgeStatus::NotFound)
    }
}

pub fn surge_name(target_name: &str) -> String {
    format!("{}{}", target_name, SURGE_BUFFER_SUFFIX)
}

fn add_surge_annotations(annotations: &mut Map<String, Value>) {
    for (key, value) in SURGE_BUFFER_ANNOTATIONS {
        annotations.insert(key.to_string(), json!(value));
    }
}

fn string_map(doc: &Value, path: &[&str]) -> Result<Map<String, Value>> {
    Ok(get_string_map(doc, path)?
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect())
}

/// Build the surge workload for `target` without touching the store.
pub fn build_surge_document(rec: &Recommendation, target: &Workload) -> Result<Value> {
    let containers: Vec<_> = rec.complete_containers().collect();
    if containers.is_empty() {
        return Err(RolloutError::configuration(
            rec.key(),
            "no container recommendation carries both a cpu and a memory target",
        ));
    }
    let replicas = surge_replicas(rec)?;

    let source = target.document();
    let mut labels = string_map(source, &["metadata", "labels"])?;
    labels.insert(SURGE_BUFFER_MARKER.to_string(), json!("true"));
    let mut annotations = string_map(source, &["metadata", "annotations"])?;
    add_surge_annotations(&mut annotations);
    let baseline = target
        .pod_template_annotations()?
        .remove(RESTARTED_AT)
        .unwrap_or_default();
    annotations.insert(SURGE_RESTART_BASELINE.to_string(), json!(baseline));

    let mut raw = source.clone();
    if let Value::Object(root) = &mut raw {
        root.remove("status");
        root.insert(
            "metadata".to_string(),
            json!({
                "name": surge_name(target.name()?),
                "namespace": target.namespace()?,
                "labels": labels,
                "annotations": annotations,
            }),
        );
    }
    ensure_map(&mut raw, &["spec", "template", "metadata", "labels"])?
        .insert(SURGE_BUFFER_MARKER.to_string(), json!("true"));
    add_surge_annotations(ensure_map(
        &mut raw,
        &["spec", "template", "metadata", "annotations"],
    )?);

    for container in containers {
        let Some((cpu, memory)) = container.complete_targets() else {
            continue;
        };
        let name = container.container_name.as_str();
        let found = set_container_resource(&mut raw, name, ResourceSlot::Requests, "cpu", &cpu.0)?;
        if !found {
            debug!(container = name, "Recommended container not in pod template, skipping");
            continue;
        }
        set_container_resource(&mut raw, name, ResourceSlot::Requests, "memory", &memory.0)?;
        set_container_resource(&mut raw, name, ResourceSlot::Limits, "memory", &memory.0)?;
    }

    let mut surge = Workload::new(raw);
    surge.set_replicas(replicas)?;
    Ok(surge.into_document())
}

/// Create the surge workload for `target`. Nothing is written if the
/// document cannot be built.
pub async fn create_surge_workload(
    store: &dyn ResourceStore,
    rec: &Recommendation,
    target: &Workload,
) -> Result<Value> {
    let doc = build_surge_document(rec, target)?;
    let created = store
        .create(&resource_kind_of(target)?, target.namespace()?, &doc)
        .await?;
    Ok(created)
}

/// Delete the surge workload of `target`. An already absent surge workload
/// is not an error.
pub async fn delete_surge_workload(store: &dyn ResourceStore, target: &Workload) -> Result<bool> {
    let name = surge_name(target.name()?);
    match store
        .delete(&resource_kind_of(target)?, target.namespace()?, &name)
        .await
    {
        Ok(()) => Ok(true),
        Err(StoreError::NotFound(_)) => {
            debug!(surge = %name, "Surge workload already gone");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Fetch the surge workload of `target`. One that is already being deleted
/// is reported as absent.
pub async fn get_surge_workload(store: &dyn ResourceStore, target: &Workload) -> Result<Option<Workload>> {
    let name = surge_name(target.name()?);
    let doc = match store
        .get(&resource_kind_of(target)?, target.namespace()?, &name)
        .await
    {
        Ok(doc) => doc,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if get_path(&doc, &["metadata", "deletionTimestamp"])?.is_some() {
        debug!(surge = %name, "Surge workload is terminating");
        return Ok(None);
    }
    Ok(Some(Workload::new(doc)))
}

pub async fn surge_exists(store: &dyn ResourceStore, target: &Workload) -> Result<bool> {
    Ok(get_surge_workload(store, target).await?.is_some())
}

/// Inspect the surge workload of `target`. Readiness uses the same health
/// rule as the target, over pods carrying the surge marker.
pub async fn surge_workload_status(store: &dyn ResourceStore, target: &Workload) -> Result<SurgeStatus> {
    let Some(surge) = get_surge_workload(store, target).await? else {
        return Ok(SurgeStatus::NotFound);
    };

    let name = surge.name()?.to_string();
    let status = if workload_is_healthy(store, &surge, PodSet::Surge).await? {
        SurgeStatus::Ready
    } else {
        SurgeStatus::NotReady
    };
    info!(surge = %name, status = ?status, "Checked surge workload");
    Ok(status)
}

/// Whether `target` has been restarted since `surge` was created.
///
/// Compares against the restart baseline recorded on the surge workload;
/// surge workloads without one fall back to their creation time.
pub fn restarted_since_surge(surge: &Workload, target: &Workload) -> Result<bool> {
    let annotations = get_string_map(surge.document(), &["metadata", "annotations"])?;
    if let Some(baseline) = annotations.get(SURGE_RESTART_BASELINE) {
        let current = target
            .pod_template_annotations()?
            .remove(RESTARTED_AT)
            .unwrap_or_default();
        return Ok(current != *baseline);
    }

    let created = get_str(surge.document(), &["metadata", "creationTimestamp"])?
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));
    match (restarted_at(target)?, created) {
        (Some(restart), Some(created)) => Ok(restart > created),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::NUMBER_OF_SURGE_BUFFER_PODS;
    use crate::document::get_containers;
    use crate::store::ResourceKind;
    use crate::testing::{deployment, pod, recommendation, InMemoryStore};

    fn deployments() -> ResourceKind {
        ResourceKind::from_type("apps/v1", "Deployment")
    }

    fn target() -> Workload {
        Workload::new(
            deployment("web")
                .replicas(6)
                .container("sidecar", "50m", "64Mi")
                .build(),
        )
    }

    #[test]
    fn test_build_surge_document() {
        let rec = recommendation("web")
            .target("app", Some("250m"), Some("256Mi"))
            .annotation(NUMBER_OF_SURGE_BUFFER_PODS, "2")
            .build();
        let doc = build_surge_document(&rec, &target()).unwrap();

        assert_eq!(doc["metadata"]["name"], "web-surge-buffer");
        assert_eq!(doc["metadata"]["namespace"], "default");
        assert_eq!(doc["metadata"]["labels"]["app"], "web");
        assert_eq!(doc["metadata"]["labels"][SURGE_BUFFER_MARKER], "true");
        assert_eq!(doc["metadata"]["annotations"]["deployment.kubernetes.io/revision"], "3");
        assert_eq!(
            doc["metadata"]["annotations"]["cluster-autoscaler.kubernetes.io/safe-to-evict"],
            "false"
        );
        assert_eq!(doc["metadata"]["annotations"][SURGE_RESTART_BASELINE], "");
        assert!(doc["metadata"].get("resourceVersion").is_none());
        assert!(doc.get("status").is_none());
        assert_eq!(doc["spec"]["replicas"], 2);
        assert_eq!(doc["spec"]["selector"]["matchLabels"]["app"], "web");

        let template = &doc["spec"]["template"]["metadata"];
        assert_eq!(template["labels"][SURGE_BUFFER_MARKER], "true");
        assert_eq!(template["annotations"]["sidecar.istio.io/inject"], "false");

        let containers = get_containers(&doc).unwrap();
        let app = containers.iter().find(|c| c.name == "app").unwrap();
        assert_eq!(app.requests["cpu"], "250m");
        assert_eq!(app.requests["memory"], "256Mi");
        assert_eq!(app.limits["memory"], "256Mi");
        assert_eq!(app.limits["cpu"], "1");

        let sidecar = containers.iter().find(|c| c.name == "sidecar").unwrap();
        assert_eq!(sidecar.requests["cpu"], "50m");
    }

    #[tokio::test]
    async fn test_create_requires_complete_targets() {
        let store = InMemoryStore::new();
        let rec = recommendation("web").target("app", Some("250m"), None).build();

        let err = create_surge_workload(&store, &rec, &target()).await.unwrap_err();
        assert!(matches!(err, RolloutError::Configuration { .. }));
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_replicas() {
        let store = InMemoryStore::new();
        let rec = recommendation("web")
            .annotation(NUMBER_OF_SURGE_BUFFER_PODS, "-1")
            .build();

        assert!(create_surge_workload(&store, &rec, &target()).await.is_err());
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_status_and_delete_lifecycle() {
        let store = InMemoryStore::new();
        let rec = recommendation("web").build();
        let target = target();
        assert_eq!(
            surge_workload_status(&store, &target).await.unwrap(),
            SurgeStatus::NotFound
        );

        create_surge_workload(&store, &rec, &target).await.unwrap();
        // Pods of the target do not count towards surge readiness.
        store.insert(&ResourceKind::pods(), pod("web-1", "web").build());
        assert_eq!(
            surge_workload_status(&store, &target).await.unwrap(),
            SurgeStatus::NotReady
        );

        store.insert(&ResourceKind::pods(), pod("web-surge-buffer-1", "web").surge().build());
        assert_eq!(
            surge_workload_status(&store, &target).await.unwrap(),
            SurgeStatus::Ready
        );

        assert!(delete_surge_workload(&store, &target).await.unwrap());
        assert!(!delete_surge_workload(&store, &target).await.unwrap());
        assert!(store.object(&deployments(), "default", "web-surge-buffer").is_none());
    }

    #[tokio::test]
    async fn test_terminating_surge_is_reported_absent() {
        let store = InMemoryStore::new();
        let target = target();
        let mut doc = create_surge_workload(&store, &recommendation("web").build(), &target)
            .await
            .unwrap();
        store.insert(&ResourceKind::pods(), pod("web-surge-buffer-1", "web").surge().build());
        assert!(surge_exists(&store, &target).await.unwrap());
        // Existence is a single get; pods are only listed for readiness.
        assert_eq!(store.list_calls(&ResourceKind::pods()), 0);

        doc["metadata"]["deletionTimestamp"] = json!("2024-06-01T12:00:00Z");
        store.insert(&deployments(), doc);

        assert!(!surge_exists(&store, &target).await.unwrap());
        assert_eq!(
            surge_workload_status(&store, &target).await.unwrap(),
            SurgeStatus::NotFound
        );
    }

    #[test]
    fn test_restarted_since_surge_uses_recorded_baseline() {
        let rec = recommendation("web").build();
        let before = Workload::new(deployment("web").restarted_at("2024-06-01T11:00:00Z").build());
        let surge = Workload::new(build_surge_document(&rec, &before).unwrap());
        assert_eq!(
            surge.document()["metadata"]["annotations"][SURGE_RESTART_BASELINE],
            "2024-06-01T11:00:00Z"
        );
        assert!(!restarted_since_surge(&surge, &before).unwrap());

        let after = Workload::new(deployment("web").restarted_at("2024-06-01T12:00:00Z").build());
        assert!(restarted_since_surge(&surge, &after).unwrap());

        // Never restarted before the session started.
        let fresh = Workload::new(build_surge_document(&rec, &target()).unwrap());
        assert!(!restarted_since_surge(&fresh, &target()).unwrap());
        assert!(restarted_since_surge(&fresh, &after).unwrap());
    }

    #[test]
    fn test_restarted_since_surge_falls_back_to_creation_time() {
        let mut doc = build_surge_document(&recommendation("web").build(), &target()).unwrap();
        doc["metadata"]["annotations"]
            .as_object_mut()
            .unwrap()
            .remove(SURGE_RESTART_BASELINE);
        doc["metadata"]["creationTimestamp"] = json!("2024-06-01T12:00:00Z");
        let surge = Workload::new(doc);

        let earlier = Workload::new(deployment("web").restarted_at("2024-06-01T11:00:00Z").build());
        let later = Workload::new(deployment("web").restarted_at("2024-06-01T12:05:00Z").build());
        assert!(!restarted_since_surge(&surge, &earlier).unwrap());
        assert!(restarted_since_surge(&surge, &later).unwrap());
        assert!(!restarted_since_surge(&surge, &target()).unwrap());
    }

    #[tokio::test]
    async fn test_status_propagates_store_errors() {
        let store = InMemoryStore::new();
        store.fail_next(
            crate::testing::Op::Get,
            &deployments(),
            StoreError::Transient("connection reset".into()),
        );
        assert!(matches!(
            surge_workload_status(&store, &target()).await,
            Err(RolloutError::Store(StoreError::Transient(_)))
        ));
    }
}
