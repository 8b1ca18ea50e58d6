//! The reconciliation engine: read, produce, compare, write, retry.
//!
//! Every call is a level-triggered pass over one identity. The store's
//! conditional write on `resourceVersion` is the only coordination; a
//! conflict re-reads and re-runs the producer on the fresher object.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::{
    empty_object, env_or, is_terminating, resource_version, significant, ConflictPolicy,
    KindRegistry, KindSpec, ObjectKey, ObjectStore, StoreError, StoreOp,
};
use kube::core::{DynamicObject, TypeMeta};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::diff::{carry_over, diff_summary, immutable_changed};
use crate::error::{ProducerError, ReconcileError};
use crate::ownership::{merge_owner_references, OwnerSpec};
use crate::producer::{from_dynamic, Modifier, NamedProducer, Producer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub conflict: ConflictPolicy,
    /// Deadline for one whole ensure call, retries included.
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { conflict: ConflictPolicy::default(), timeout: Duration::from_millis(30_000) }
    }
}

impl EngineConfig {
    /// `KEEL_CONFLICT_*` plus `KEEL_ENSURE_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self {
            conflict: ConflictPolicy::from_env(),
            timeout: Duration::from_millis(env_or("KEEL_ENSURE_TIMEOUT_MS", 30_000u64)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureAction {
    Created,
    Updated,
    Unchanged,
    /// An immutable field changed; the object was deleted and created again.
    Recreated,
    /// The object is being deleted; nothing was written. Requeue.
    Terminating,
}

impl EnsureAction {
    pub fn wrote(self) -> bool {
        matches!(self, EnsureAction::Created | EnsureAction::Updated | EnsureAction::Recreated)
    }
}

impl std::fmt::Display for EnsureAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnsureAction::Created => "created",
            EnsureAction::Updated => "updated",
            EnsureAction::Unchanged => "unchanged",
            EnsureAction::Recreated => "recreated",
            EnsureAction::Terminating => "terminating",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    /// Stored object after the call (current one when nothing was written).
    pub object: DynamicObject,
    pub action: EnsureAction,
    /// Attempts used, 1 when there was no conflict.
    pub attempts: u32,
}

enum Attempt {
    Done(EnsureAction, DynamicObject),
    Retry(StoreError),
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn ObjectStore>,
    registry: Arc<KindRegistry>,
    config: EngineConfig,
    owner: Option<OwnerSpec>,
}

impl Engine {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Arc<KindRegistry>, config: EngineConfig) -> Self {
        Self { store, registry, config, owner: None }
    }

    /// Engine whose writes carry `owner` as the controller reference.
    pub fn for_owner(&self, owner: OwnerSpec) -> Self {
        Self { owner: Some(owner), ..self.clone() }
    }

    pub fn owner(&self) -> Option<&OwnerSpec> {
        self.owner.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reconcile `kind` (a registry key such as `v1/Secret`) `namespace/name`
    /// toward what `producer` returns.
    pub async fn ensure(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        producer: &Producer,
    ) -> Result<EnsureOutcome, ReconcileError> {
        let spec = self.registry.get(kind).ok_or_else(|| ReconcileError::UnknownKind(kind.to_string()))?;
        self.ensure_spec(spec, name, namespace, producer).await
    }

    /// Typed front end: `K` selects the kind, the producer works on `K`.
    pub async fn ensure_typed<K, F>(
        &self,
        name: &str,
        namespace: Option<&str>,
        f: F,
    ) -> Result<(K, EnsureAction), ReconcileError>
    where
        K: k8s_openapi::Resource + k8s_openapi::Metadata<Ty = ObjectMeta> + Serialize + DeserializeOwned + Default + 'static,
        F: Fn(K) -> Result<K, ProducerError> + Send + Sync + 'static,
    {
        let spec = self.registry.spec_for::<K>();
        let out = self.ensure_spec(&spec, name, namespace, &Producer::typed(f)).await?;
        let key = spec.kind.key(namespace, name);
        let typed = from_dynamic(&out.object).map_err(|source| ReconcileError::Codec { key, source })?;
        Ok((typed, out.action))
    }

    /// Reconcile every named producer of one kind in order, each wrapped in
    /// `modifiers`. Stops at the first error.
    pub async fn ensure_all(
        &self,
        kind: &str,
        namespace: Option<&str>,
        producers: &[NamedProducer],
        modifiers: &[Modifier],
    ) -> Result<Vec<EnsureOutcome>, ReconcileError> {
        let spec = self.registry.get(kind).ok_or_else(|| ReconcileError::UnknownKind(kind.to_string()))?;
        let mut out = Vec::with_capacity(producers.len());
        for np in producers {
            let producer = np.producer.clone().with_modifiers(modifiers);
            out.push(self.ensure_spec(spec, &np.name, namespace, &producer).await?);
        }
        Ok(out)
    }

    pub async fn ensure_spec(
        &self,
        spec: &KindSpec,
        name: &str,
        namespace: Option<&str>,
        producer: &Producer,
    ) -> Result<EnsureOutcome, ReconcileError> {
        let t0 = Instant::now();
        let key = spec.kind.key(namespace, name);
        let res = self.run(spec, &key, namespace, producer).await;
        histogram!("ensure_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(out) => {
                match out.action {
                    EnsureAction::Created => counter!("ensure_created", 1u64),
                    EnsureAction::Updated => counter!("ensure_updated", 1u64),
                    EnsureAction::Recreated => counter!("ensure_recreated", 1u64),
                    EnsureAction::Unchanged | EnsureAction::Terminating => counter!("ensure_noop", 1u64),
                }
                if out.action.wrote() {
                    info!(key = %key, action = %out.action, attempts = out.attempts, "ensured");
                } else {
                    debug!(key = %key, action = %out.action, "ensure without write");
                }
            }
            Err(e) => {
                counter!("ensure_err", 1u64);
                warn!(key = %key, error = %e, "ensure failed");
            }
        }
        res
    }

    async fn run(
        &self,
        spec: &KindSpec,
        key: &ObjectKey,
        namespace: Option<&str>,
        producer: &Producer,
    ) -> Result<EnsureOutcome, ReconcileError> {
        check_identity(spec, key, namespace)?;
        if let Some(owner) = &self.owner {
            owner
                .check_scope(&spec.kind, key.namespace.as_deref())
                .map_err(|reason| ReconcileError::Ownership { key: key.clone(), reason })?;
        }
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let max = self.config.conflict.attempts();
        let mut last = None;
        for attempt in 1..=max {
            match self.attempt(spec, key, producer, deadline).await? {
                Attempt::Done(action, object) => return Ok(EnsureOutcome { object, action, attempts: attempt }),
                Attempt::Retry(err) => {
                    counter!("ensure_conflict", 1u64);
                    debug!(key = %key, attempt, error = %err, "write raced; re-reading");
                    last = Some(err);
                    if attempt < max {
                        tokio::time::timeout_at(deadline, self.config.conflict.pause())
                            .await
                            .map_err(|_| ReconcileError::TimedOut { key: key.clone(), op: StoreOp::Get })?;
                    }
                }
            }
        }
        Err(ReconcileError::ConflictExhausted {
            key: key.clone(),
            attempts: max,
            last: last.unwrap_or_else(|| StoreError::Conflict(key.to_string())),
        })
    }

    async fn attempt(
        &self,
        spec: &KindSpec,
        key: &ObjectKey,
        producer: &Producer,
        deadline: tokio::time::Instant,
    ) -> Result<Attempt, ReconcileError> {
        let current = bounded(key, StoreOp::Get, deadline, self.store.get(key)).await?;
        let base = current.clone().unwrap_or_else(|| empty_object(key));
        let produced = producer
            .produce(base)
            .map_err(|source| ReconcileError::Producer { key: key.clone(), source })?;
        let desired = self.normalize(spec, key, current.as_ref(), produced)?;

        let Some(current) = current else {
            return match bounded_raw(key, StoreOp::Create, deadline, self.store.create(&spec.kind, &for_create(desired)))
                .await?
            {
                Ok(created) => Ok(Attempt::Done(EnsureAction::Created, created)),
                Err(e) if e.is_conflict() => Ok(Attempt::Retry(e)),
                Err(source) => Err(ReconcileError::Store { key: key.clone(), op: StoreOp::Create, source }),
            };
        };

        if is_terminating(&current) {
            return Ok(Attempt::Done(EnsureAction::Terminating, current));
        }

        let cur_sig = significant(&current).map_err(|source| ReconcileError::Codec { key: key.clone(), source })?;
        let des_sig = significant(&desired).map_err(|source| ReconcileError::Codec { key: key.clone(), source })?;
        if cur_sig == des_sig {
            return Ok(Attempt::Done(EnsureAction::Unchanged, current));
        }
        let summary = diff_summary(&des_sig, &cur_sig);

        let changed = immutable_changed(&cur_sig, &des_sig, &spec.immutable_fields);
        if !changed.is_empty() {
            info!(key = %key, fields = ?changed, "immutable fields changed; recreating");
            return self.recreate(spec, key, current, desired, deadline).await;
        }

        let mut desired = desired;
        desired.metadata.resource_version = resource_version(&current).map(str::to_string);
        info!(key = %key, adds = summary.adds, updates = summary.updates, removes = summary.removes, "updating");
        match bounded_raw(key, StoreOp::Update, deadline, self.store.update(&spec.kind, &desired)).await? {
            Ok(updated) => Ok(Attempt::Done(EnsureAction::Updated, updated)),
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(Attempt::Retry(e)),
            Err(source) => Err(ReconcileError::Store { key: key.clone(), op: StoreOp::Update, source }),
        }
    }

    async fn recreate(
        &self,
        spec: &KindSpec,
        key: &ObjectKey,
        current: DynamicObject,
        desired: DynamicObject,
        deadline: tokio::time::Instant,
    ) -> Result<Attempt, ReconcileError> {
        match bounded_raw(key, StoreOp::Delete, deadline, self.store.delete(key)).await? {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => return Err(ReconcileError::Store { key: key.clone(), op: StoreOp::Delete, source }),
        }
        match bounded_raw(key, StoreOp::Create, deadline, self.store.create(&spec.kind, &for_create(desired))).await? {
            Ok(created) => Ok(Attempt::Done(EnsureAction::Recreated, created)),
            // old object still held by finalizers
            Err(StoreError::AlreadyExists(_)) => Ok(Attempt::Done(EnsureAction::Terminating, current)),
            Err(source) => Err(ReconcileError::Store { key: key.clone(), op: StoreOp::Create, source }),
        }
    }

    /// Validate producer output and fold in what it does not own: type meta,
    /// owner references, finalizers, status and server-assigned fields.
    fn normalize(
        &self,
        spec: &KindSpec,
        key: &ObjectKey,
        current: Option<&DynamicObject>,
        mut desired: DynamicObject,
    ) -> Result<DynamicObject, ReconcileError> {
        let identity = |reason: String| ReconcileError::Identity { key: key.clone(), reason };
        match desired.metadata.name.as_deref() {
            None | Some("") => return Err(identity("metadata.name is missing".into())),
            Some(n) if n != key.name => return Err(identity(format!("metadata.name changed to {n}"))),
            Some(_) => {}
        }
        let ns = desired.metadata.namespace.as_deref().filter(|s| !s.is_empty());
        if ns != key.namespace.as_deref() {
            return Err(identity(format!("metadata.namespace is {:?}, expected {:?}", ns, key.namespace)));
        }
        if let Some(types) = &desired.types {
            if types.kind != spec.kind.kind || types.api_version != spec.kind.api_version() {
                return Err(identity(format!("type changed to {}/{}", types.api_version, types.kind)));
            }
        }
        desired.types = Some(TypeMeta { api_version: spec.kind.api_version(), kind: spec.kind.kind.clone() });

        let current_refs = current.and_then(|c| c.metadata.owner_references.as_deref()).unwrap_or(&[]);
        let desired_refs = desired.metadata.owner_references.as_deref().unwrap_or(&[]);
        let expected = self.owner.as_ref().map(|o| &o.reference);
        let merged = merge_owner_references(current_refs, desired_refs, expected)
            .map_err(|reason| ReconcileError::Ownership { key: key.clone(), reason })?;
        desired.metadata.owner_references = if merged.is_empty() { None } else { Some(merged) };

        if desired.metadata.finalizers.is_none() {
            desired.metadata.finalizers = current.and_then(|c| c.metadata.finalizers.clone());
        }

        let Some(current) = current else { return Ok(desired) };
        let codec = |source| ReconcileError::Codec { key: key.clone(), source };
        let current_json = serde_json::to_value(current).map_err(codec)?;
        let mut desired_json = serde_json::to_value(&desired).map_err(codec)?;
        let carried: Vec<String> = spec.server_fields.iter().chain(spec.immutable_fields.iter()).cloned().collect();
        carry_over(&mut desired_json, &current_json, &carried);
        let mut out: DynamicObject = serde_json::from_value(desired_json).map_err(codec)?;
        restore_envelope(&mut out.metadata, &current.metadata);
        Ok(out)
    }
}

fn check_identity(spec: &KindSpec, key: &ObjectKey, namespace: Option<&str>) -> Result<(), ReconcileError> {
    let identity = |reason: &str| ReconcileError::Identity { key: key.clone(), reason: reason.to_string() };
    if key.name.is_empty() {
        return Err(identity("name is empty"));
    }
    match (spec.kind.namespaced, namespace.filter(|s| !s.is_empty())) {
        (true, None) => Err(identity("namespace is required for a namespaced kind")),
        (false, Some(_)) => Err(identity("cluster-scoped kind takes no namespace")),
        _ => Ok(()),
    }
}

/// Store-owned metadata comes from the live object, never from a producer.
fn restore_envelope(meta: &mut ObjectMeta, live: &ObjectMeta) {
    meta.uid = live.uid.clone();
    meta.resource_version = live.resource_version.clone();
    meta.creation_timestamp = live.creation_timestamp.clone();
    meta.deletion_timestamp = live.deletion_timestamp.clone();
    meta.generation = live.generation;
    meta.managed_fields = live.managed_fields.clone();
}

fn for_create(mut obj: DynamicObject) -> DynamicObject {
    let m = &mut obj.metadata;
    m.uid = None;
    m.resource_version = None;
    m.creation_timestamp = None;
    m.deletion_timestamp = None;
    m.deletion_grace_period_seconds = None;
    m.generation = None;
    m.managed_fields = None;
    if let Some(data) = obj.data.as_object_mut() {
        data.remove("status");
    }
    obj
}

async fn bounded_raw<T>(
    key: &ObjectKey,
    op: StoreOp,
    deadline: tokio::time::Instant,
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<Result<T, StoreError>, ReconcileError> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| ReconcileError::TimedOut { key: key.clone(), op })
}

async fn bounded<T>(
    key: &ObjectKey,
    op: StoreOp,
    deadline: tokio::time::Instant,
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, ReconcileError> {
    bounded_raw(key, op, deadline, fut)
        .await?
        .map_err(|source| ReconcileError::Store { key: key.clone(), op, source })
}
