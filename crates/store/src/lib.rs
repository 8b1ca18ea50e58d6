//! Keel in-memory object store.
//!
//! Behaves like the API server for the parts the engine and the orchestrator
//! rely on: store-assigned `uid`/`resourceVersion`/`creationTimestamp`,
//! conditional updates, `deletionTimestamp` + finalizers gating physical
//! removal, and background garbage collection of dependents whose owners are
//! all gone. Kinds registered with [`MemoryStore::with_status_subresource`]
//! keep `status` out of plain updates, as a CRD with a status subresource
//! does. Faults and interleaved writers can be injected per operation.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use keel_core::{is_terminating, ObjectKey, ObjectStore, ResourceKind, StoreError, StoreOp};
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// Change notification; what a watch would deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub key: ObjectKey,
    pub kind: DeltaKind,
    pub resource_version: String,
}

/// Runs once, outside the store lock, right before the targeted operation.
pub type Hook = Box<dyn FnOnce(&MemoryStore) + Send>;

enum Fault {
    Fail(StoreError),
    Hook(Hook),
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjectKey, DynamicObject>,
    next_rv: u64,
    writes: u64,
    faults: VecDeque<(StoreOp, Fault)>,
    status_kinds: FxHashSet<ResourceKind>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Delta>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { inner: Mutex::new(Inner::default()), events }
    }

    /// `update` on `kind` leaves `status` as it is; only `update_status`
    /// changes it.
    pub fn with_status_subresource(self, kind: &ResourceKind) -> Self {
        self.lock().status_kinds.insert(kind.clone());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.events.subscribe()
    }

    /// Number of successful writes (create, update, status, delete) so far.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    /// Fail the next `op` with `err`.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.lock().faults.push_back((op, Fault::Fail(err)));
    }

    /// Run `hook` right before the next `op`, e.g. to simulate another writer
    /// sneaking in between a read and a write.
    pub fn before_next(&self, op: StoreOp, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        self.lock().faults.push_back((op, Fault::Hook(Box::new(hook))));
    }

    fn take_fault(&self, op: StoreOp) -> Result<(), StoreError> {
        let fault = {
            let mut inner = self.lock();
            let pos = inner.faults.iter().position(|(o, _)| *o == op);
            pos.and_then(|i| inner.faults.remove(i)).map(|(_, f)| f)
        };
        match fault {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Hook(hook)) => {
                hook(self);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn emit(&self, key: &ObjectKey, kind: DeltaKind, rv: &str) {
        let _ = self.events.send(Delta { key: key.clone(), kind, resource_version: rv.to_string() });
    }

    /// Out-of-band edit by another writer; bumps `resourceVersion`.
    pub fn edit(&self, key: &ObjectKey, f: impl FnOnce(&mut DynamicObject)) -> Result<DynamicObject, StoreError> {
        let (out, rv) = {
            let mut inner = self.lock();
            let rv = inner.bump();
            let obj = inner.objects.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            f(obj);
            obj.metadata.resource_version = Some(rv.clone());
            let out = obj.clone();
            inner.writes += 1;
            (out, rv)
        };
        self.emit(key, DeltaKind::Applied, &rv);
        Ok(out)
    }

    fn key_for(kind: &ResourceKind, obj: &DynamicObject) -> Result<ObjectKey, StoreError> {
        let key = ObjectKey::of(kind, obj).ok_or_else(|| StoreError::Invalid(format!("{kind}: metadata.name is required")))?;
        if kind.namespaced && key.namespace.is_none() {
            return Err(StoreError::Invalid(format!("{key}: namespace is required for namespaced kind")));
        }
        Ok(key)
    }

    fn create_sync(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = Self::key_for(kind, obj)?;
        let (out, rv) = {
            let mut inner = self.lock();
            if inner.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            let rv = inner.bump();
            let mut stored = obj.clone();
            stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            stored.metadata.deletion_timestamp = None;
            stored.metadata.resource_version = Some(rv.clone());
            if !kind.namespaced {
                stored.metadata.namespace = None;
            }
            inner.objects.insert(key.clone(), stored.clone());
            inner.writes += 1;
            (stored, rv)
        };
        counter!("store_create", 1u64);
        self.emit(&key, DeltaKind::Applied, &rv);
        Ok(out)
    }

    fn update_sync(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = Self::key_for(kind, obj)?;
        let mut removed = Vec::new();
        let (out, rv) = {
            let mut inner = self.lock();
            let live = inner.objects.get(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if let Some(rv) = obj.metadata.resource_version.as_deref() {
                if live.metadata.resource_version.as_deref() != Some(rv) {
                    return Err(StoreError::Conflict(format!(
                        "{key}: resourceVersion {rv} is stale (live {})",
                        live.metadata.resource_version.as_deref().unwrap_or("")
                    )));
                }
            }
            if is_terminating(live) {
                let had: FxHashSet<&String> = live.metadata.finalizers.iter().flatten().collect();
                if obj.metadata.finalizers.iter().flatten().any(|f| !had.contains(f)) {
                    return Err(StoreError::Invalid(format!("{key}: no new finalizers can be added while terminating")));
                }
            }
            let mut stored = obj.clone();
            if inner.status_kinds.contains(kind) {
                set_status(&mut stored, live.data.get("status").cloned());
            }
            stored.metadata.uid = live.metadata.uid.clone();
            stored.metadata.creation_timestamp = live.metadata.creation_timestamp.clone();
            stored.metadata.deletion_timestamp = live.metadata.deletion_timestamp.clone();
            if !kind.namespaced {
                stored.metadata.namespace = None;
            }
            let rv = inner.bump();
            stored.metadata.resource_version = Some(rv.clone());
            inner.writes += 1;
            if is_terminating(&stored) && stored.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty()) {
                inner.objects.remove(&key);
                removed.push(key.clone());
                collect_garbage(&mut inner, &mut removed);
            } else {
                inner.objects.insert(key.clone(), stored.clone());
            }
            (stored, rv)
        };
        counter!("store_update", 1u64);
        if removed.first() == Some(&key) {
            debug!(key = %key, "last finalizer removed; object deleted");
        } else {
            self.emit(&key, DeltaKind::Applied, &rv);
        }
        for k in &removed {
            self.emit(k, DeltaKind::Deleted, &rv);
        }
        Ok(out)
    }

    /// Replace `status` only; everything else stays as stored.
    fn update_status_sync(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = Self::key_for(kind, obj)?;
        let (out, rv) = {
            let mut inner = self.lock();
            let rv = inner.bump();
            let live = inner.objects.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if let Some(want) = obj.metadata.resource_version.as_deref() {
                if live.metadata.resource_version.as_deref() != Some(want) {
                    return Err(StoreError::Conflict(format!(
                        "{key}: resourceVersion {want} is stale (live {})",
                        live.metadata.resource_version.as_deref().unwrap_or("")
                    )));
                }
            }
            set_status(live, obj.data.get("status").cloned());
            live.metadata.resource_version = Some(rv.clone());
            let out = live.clone();
            inner.writes += 1;
            (out, rv)
        };
        counter!("store_update_status", 1u64);
        self.emit(&key, DeltaKind::Applied, &rv);
        Ok(out)
    }

    fn delete_sync(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut removed = Vec::new();
        let marked = {
            let mut inner = self.lock();
            if !inner.objects.contains_key(key) {
                return Err(StoreError::NotFound(key.to_string()));
            }
            inner.writes += 1;
            delete_in(&mut inner, key, &mut removed)
        };
        counter!("store_delete", 1u64);
        if let Some(rv) = marked {
            self.emit(key, DeltaKind::Applied, &rv);
        }
        for k in &removed {
            self.emit(k, DeltaKind::Deleted, "");
        }
        Ok(())
    }

    fn list_sync(&self, kind: &ResourceKind, namespace: Option<&str>) -> Vec<DynamicObject> {
        let inner = self.lock();
        let mut out: Vec<(&ObjectKey, &DynamicObject)> = inner
            .objects
            .iter()
            .filter(|(k, _)| k.kind == *kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .collect();
        out.sort_by(|a, b| a.0.namespace.cmp(&b.0.namespace).then(a.0.name.cmp(&b.0.name)));
        out.into_iter().map(|(_, o)| o.clone()).collect()
    }
}

fn set_status(obj: &mut DynamicObject, status: Option<serde_json::Value>) {
    match (obj.data.as_object_mut(), status) {
        (Some(data), Some(status)) => {
            data.insert("status".to_string(), status);
        }
        (Some(data), None) => {
            data.remove("status");
        }
        (None, Some(status)) => obj.data = serde_json::json!({ "status": status }),
        (None, None) => {}
    }
}

/// Delete one object: mark it when finalizers remain, otherwise remove it and
/// collect its garbage. Returns the new resourceVersion when only marked.
fn delete_in(inner: &mut Inner, key: &ObjectKey, removed: &mut Vec<ObjectKey>) -> Option<String> {
    let has_finalizers = inner
        .objects
        .get(key)
        .map(|o| o.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()))?;
    if has_finalizers {
        if inner.objects.get(key).is_some_and(is_terminating) {
            return None;
        }
        let rv = inner.bump();
        let obj = inner.objects.get_mut(key)?;
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        obj.metadata.resource_version = Some(rv.clone());
        return Some(rv);
    }
    inner.objects.remove(key);
    removed.push(key.clone());
    collect_garbage(inner, removed);
    None
}

/// Background cascading deletion: an object whose owner references all point
/// at uids no longer in the store is deleted (or marked, if it has
/// finalizers). Repeats until nothing changes.
fn collect_garbage(inner: &mut Inner, removed: &mut Vec<ObjectKey>) {
    loop {
        let live: FxHashSet<String> = inner.objects.values().filter_map(|o| o.metadata.uid.clone()).collect();
        let orphans: Vec<ObjectKey> = inner
            .objects
            .iter()
            .filter(|(_, o)| !is_terminating(o))
            .filter(|(_, o)| {
                let refs = o.metadata.owner_references.as_deref().unwrap_or(&[]);
                !refs.is_empty() && refs.iter().all(|r| !live.contains(&r.uid))
            })
            .map(|(k, _)| k.clone())
            .collect();
        if orphans.is_empty() {
            return;
        }
        for key in orphans {
            debug!(key = %key, "garbage collecting dependent");
            let has_finalizers = inner
                .objects
                .get(&key)
                .is_some_and(|o| o.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()));
            if has_finalizers {
                let rv = inner.bump();
                if let Some(o) = inner.objects.get_mut(&key) {
                    o.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                    o.metadata.resource_version = Some(rv);
                }
            } else {
                inner.objects.remove(&key);
                removed.push(key);
            }
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        self.take_fault(StoreOp::Get)?;
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.take_fault(StoreOp::Create)?;
        self.create_sync(kind, obj)
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.take_fault(StoreOp::Update)?;
        self.update_sync(kind, obj)
    }

    async fn update_status(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        self.take_fault(StoreOp::UpdateStatus)?;
        self.update_status_sync(kind, obj)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.take_fault(StoreOp::Delete)?;
        self.delete_sync(key)
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        self.take_fault(StoreOp::List)?;
        Ok(self.list_sync(kind, namespace))
    }
}
