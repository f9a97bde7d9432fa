//! [`ResourceStore`] backed by the Kubernetes API

use super::{ObjectList, ResourceKind, ResourceStore, WatchEvent, WatchStream};
use crate::error::StoreError;
use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    WatchEvent as KubeWatchEvent, WatchParams,
};
use kube::Client;
use serde_json::Value;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::debug;

/// Store implementation over dynamic (untyped) Kubernetes objects.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a store from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default().await.map_err(map_error)?;
        Ok(Self::new(client))
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = api_resource(kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn api_resource(kind: &ResourceKind) -> ApiResource {
    ApiResource {
        group: kind.group.clone(),
        version: kind.version.clone(),
        api_version: kind.api_version(),
        kind: kind.kind.clone(),
        plural: kind.plural.clone(),
    }
}

fn map_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(resp.message),
            409 => StoreError::Conflict(resp.message),
            410 => StoreError::Expired(resp.message),
            _ => StoreError::Transient(format!("{} ({})", resp.message, resp.code)),
        },
        other => StoreError::Transient(other.to_string()),
    }
}

fn to_value(obj: DynamicObject) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Transient(e.to_string()))
}

fn map_watch_event(event: kube::Result<KubeWatchEvent<DynamicObject>>) -> Result<WatchEvent, StoreError> {
    match event.map_err(map_error)? {
        KubeWatchEvent::Added(obj) => Ok(WatchEvent::Added(to_value(obj)?)),
        KubeWatchEvent::Modified(obj) => Ok(WatchEvent::Modified(to_value(obj)?)),
        KubeWatchEvent::Deleted(obj) => Ok(WatchEvent::Deleted(to_value(obj)?)),
        KubeWatchEvent::Bookmark(bookmark) => Ok(WatchEvent::Bookmark(bookmark.metadata.resource_version)),
        KubeWatchEvent::Error(resp) if resp.code == 410 => Err(StoreError::Expired(resp.message)),
        KubeWatchEvent::Error(resp) => Ok(WatchEvent::Error(format!("{} ({})", resp.message, resp.code))),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<Value, StoreError> {
        let obj = self.api(kind, Some(namespace)).get(name).await.map_err(map_error)?;
        to_value(obj)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList, StoreError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self.api(kind, namespace).list(&params).await.map_err(map_error)?;
        debug!(kind = %kind, items = list.items.len(), "Listed resources");

        Ok(ObjectList {
            resource_version: list.metadata.resource_version,
            items: list
                .items
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        name: &str,
        merge_patch: &Value,
        field_manager: &str,
    ) -> Result<Value, StoreError> {
        let params = PatchParams {
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        };
        let obj = self
            .api(kind, Some(namespace))
            .patch(name, &params, &Patch::Merge(merge_patch))
            .await
            .map_err(map_error)?;
        to_value(obj)
    }

    async fn create(&self, kind: &ResourceKind, namespace: &str, doc: &Value) -> Result<Value, StoreError> {
        let obj: DynamicObject = serde_json::from_value(doc.clone())
            .map_err(|e| StoreError::Transient(format!("unencodable object: {}", e)))?;
        let created = self
            .api(kind, Some(namespace))
            .create(&PostParams::default(), &obj)
            .await
            .map_err(map_error)?;
        to_value(created)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api(kind, Some(namespace))
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        resume_version: &str,
        timeout: Duration,
    ) -> Result<WatchStream, StoreError> {
        // The API server caps timeoutSeconds below 295s for watch requests.
        let timeout_secs = timeout.as_secs().clamp(1, 290) as u32;
        let params = WatchParams::default().timeout(timeout_secs);
        let stream = self
            .api(kind, namespace)
            .watch(&params, resume_version)
            .await
            .map_err(map_error)?;
        Ok(Box::pin(stream.map(map_watch_event)))
    }
}
