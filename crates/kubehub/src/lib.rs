//! Keel kubehub: the object store capability over a live API server, plus
//! discovery and watch wiring for the outer controller.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use keel_core::{parse_gvk_key, ObjectKey, ObjectStore, ResourceKind, StoreError};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "keel";

/// Map a kube client error onto the store taxonomy.
pub fn classify(err: kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) => {
            let msg = format!("{what}: {}", ae.message);
            match ae.code {
                404 => StoreError::NotFound(msg),
                409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(msg),
                409 => StoreError::Conflict(msg),
                401 | 403 => StoreError::Forbidden(msg),
                400 | 422 => StoreError::Invalid(msg),
                _ => StoreError::Unavailable(format!("{msg} (HTTP {})", ae.code)),
            }
        }
        kube::Error::SerdeError(e) => StoreError::Invalid(format!("{what}: {e}")),
        other => StoreError::Unavailable(format!("{what}: {other}")),
    }
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match (kind.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn post_params() -> PostParams {
        PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() }
    }

    fn target(kind: &ResourceKind, obj: &DynamicObject) -> Result<ObjectKey, StoreError> {
        let key = ObjectKey::of(kind, obj).ok_or_else(|| StoreError::Invalid(format!("{kind}: metadata.name is required")))?;
        if kind.namespaced && key.namespace.is_none() {
            return Err(StoreError::Invalid(format!("{key}: namespace is required for namespaced kind")));
        }
        Ok(key)
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        self.api(&key.kind, key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(|e| classify(e, &key.to_string()))
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = Self::target(kind, obj)?;
        let out = self
            .api(kind, key.namespace.as_deref())
            .create(&Self::post_params(), obj)
            .await
            .map_err(|e| classify(e, &key.to_string()))?;
        counter!("kube_create", 1u64);
        Ok(out)
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = Self::target(kind, obj)?;
        let out = self
            .api(kind, key.namespace.as_deref())
            .replace(&key.name, &Self::post_params(), obj)
            .await
            .map_err(|e| classify(e, &key.to_string()))?;
        counter!("kube_update", 1u64);
        Ok(out)
    }

    async fn update_status(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = Self::target(kind, obj)?;
        let body = serde_json::to_vec(obj).map_err(|e| StoreError::Invalid(format!("{key}: {e}")))?;
        let out = self
            .api(kind, key.namespace.as_deref())
            .replace_status(&key.name, &Self::post_params(), body)
            .await
            .map_err(|e| classify(e, &key.to_string()))?;
        counter!("kube_update_status", 1u64);
        Ok(out)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api(&key.kind, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, &key.to_string()))?;
        counter!("kube_delete", 1u64);
        Ok(())
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, &kind.gvk_key()))?;
        Ok(list.items)
    }
}

/// Resolve a G/V/K key (e.g. a CRD such as `kubermatic.k8s.io/v1/Cluster`)
/// to a [`ResourceKind`] via discovery.
pub async fn discover_kind(client: Client, gvk_key: &str) -> Result<ResourceKind> {
    let (group, version, kind) =
        parse_gvk_key(gvk_key).ok_or_else(|| anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", gvk_key))?;
    let gvk = GroupVersionKind { group, version, kind };
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok(ResourceKind::new(&ar.group, &ar.version, &ar.kind, &ar.plural, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// List+watch `kind` and send the key of every touched object. Level
/// triggered: consumers re-read the object, so only the key travels.
pub async fn watch_keys(client: Client, kind: ResourceKind, namespace: Option<String>, tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let ar = kind.api_resource();
    let api: Api<DynamicObject> = match (kind.namespaced, namespace.as_deref()) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let objs = match ev {
            Event::Applied(o) | Event::Deleted(o) => vec![o],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list
            }
        };
        for o in objs.iter() {
            if let Some(key) = ObjectKey::of(&kind, o) {
                if tx.send(key).await.is_err() {
                    debug!("key receiver dropped; stopping watcher");
                    return Ok(());
                }
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}
