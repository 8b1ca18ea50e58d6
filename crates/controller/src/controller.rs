//! Owner-level dispatch: ensure blueprints while the owner lives, run the
//! ordered teardown once it is being deleted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use keel_apply::{Engine, EngineConfig, EnsureAction, Modifier, OwnerSpec, ReconcileError};
use keel_core::{env_or, is_terminating, Classify, ErrorClass, KindRegistry, ObjectKey, ObjectStore, ResourceKind};
use keel_teardown::{CleanupError, FinalizerStep, Orchestrator, OrchestratorConfig};
use kube::core::DynamicObject;
use kube::runtime::controller::Action;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::blueprint::{order, Blueprint, BlueprintError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub engine: EngineConfig,
    pub orchestrator: OrchestratorConfig,
    /// Requeue delay while something is pending (a cleanup step, an object
    /// still terminating).
    pub requeue_pending: Duration,
    pub requeue_error: Duration,
    /// Periodic re-ensure of a healthy owner.
    pub resync: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            requeue_pending: Duration::from_secs(10),
            requeue_error: Duration::from_secs(30),
            resync: Duration::from_secs(300),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self {
            engine: EngineConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
            requeue_pending: Duration::from_secs(env_or("KEEL_REQUEUE_PENDING_SECS", 10u64)),
            requeue_error: Duration::from_secs(env_or("KEEL_REQUEUE_ERROR_SECS", 30u64)),
            resync: Duration::from_secs(env_or("KEEL_RESYNC_SECS", 300u64)),
        }
    }
}

/// What the caller should do with the owner after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Requeue(Duration),
    AwaitChange,
}

impl From<Next> for Action {
    fn from(n: Next) -> Self {
        match n {
            Next::Requeue(d) => Action::requeue(d),
            Next::AwaitChange => Action::await_change(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Blueprint(#[from] BlueprintError),
    #[error("owner: {0}")]
    Owner(String),
    #[error("blueprint {blueprint}: {source}")]
    Reconcile {
        blueprint: String,
        #[source]
        source: ReconcileError,
    },
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}

impl Classify for ControllerError {
    fn class(&self) -> ErrorClass {
        match self {
            ControllerError::Blueprint(_) | ControllerError::Owner(_) => ErrorClass::FatalLocal,
            ControllerError::Reconcile { source, .. } => source.class(),
            ControllerError::Cleanup(e) => e.class(),
        }
    }
}

pub struct ClusterController {
    store: Arc<dyn ObjectStore>,
    owner_kind: ResourceKind,
    engine: Engine,
    orchestrator: Orchestrator,
    blueprints: Vec<Blueprint>,
    steps: Vec<Arc<dyn FinalizerStep>>,
    modifiers: Vec<Modifier>,
    config: ControllerConfig,
}

impl ClusterController {
    /// `store` holds the owners and their dependents. Blueprints are put in
    /// dependency order here; a bad graph fails construction.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<KindRegistry>,
        owner_kind: ResourceKind,
        blueprints: Vec<Blueprint>,
        steps: Vec<Arc<dyn FinalizerStep>>,
        config: ControllerConfig,
    ) -> Result<Self, BlueprintError> {
        Ok(Self {
            engine: Engine::new(store.clone(), registry, config.engine.clone()),
            orchestrator: Orchestrator::new(store.clone(), config.orchestrator.clone()),
            store,
            owner_kind,
            blueprints: order(blueprints)?,
            steps,
            modifiers: Vec::new(),
            config,
        })
    }

    /// Modifiers applied to every object after its producer.
    pub fn with_modifiers(mut self, modifiers: Vec<Modifier>) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn blueprints(&self) -> &[Blueprint] {
        &self.blueprints
    }

    pub fn owner_kind(&self) -> &ResourceKind {
        &self.owner_kind
    }

    /// One level-triggered pass over `owner`.
    pub async fn reconcile(&self, owner: &DynamicObject) -> Result<Next, ControllerError> {
        if is_terminating(owner) {
            let out = self.orchestrator.cleanup(&self.owner_kind, owner, &self.steps).await?;
            debug!(owner = ?owner.metadata.name, state = ?out.state, blocking = ?out.blocking, "cleanup pass");
            return Ok(if out.done {
                Next::AwaitChange
            } else if out.progressed {
                Next::Requeue(Duration::ZERO)
            } else {
                Next::Requeue(self.config.requeue_pending)
            });
        }

        let markers: Vec<&str> = self.steps.iter().map(|s| s.marker()).collect();
        let owner = self.orchestrator.ensure_finalizers(&self.owner_kind, owner, &markers).await?;
        let spec = OwnerSpec::controller_of(&self.owner_kind, &owner).map_err(ControllerError::Owner)?;
        let engine = self.engine.for_owner(spec);

        for bp in &self.blueprints {
            let namespace = bp.placement.namespace_for(&owner);
            let outs = engine
                .ensure_all(&bp.kind, namespace.as_deref(), &bp.producers_for(&owner), &self.modifiers)
                .await
                .map_err(|source| ControllerError::Reconcile { blueprint: bp.id.clone(), source })?;
            let written = outs.iter().filter(|o| o.action.wrote()).count();
            if written > 0 {
                info!(owner = ?owner.metadata.name, blueprint = %bp.id, written, "blueprint reconciled");
            }
            if let Some(t) = outs.iter().find(|o| o.action == EnsureAction::Terminating) {
                info!(blueprint = %bp.id, object = ?t.object.metadata.name, "waiting for deletion to finish");
                return Ok(Next::Requeue(self.config.requeue_pending));
            }
        }
        Ok(Next::Requeue(self.config.resync))
    }

    pub fn error_policy(&self, err: &ControllerError) -> Next {
        if err.is_retryable() {
            warn!(error = %err, class = %err.class(), "reconcile failed; requeueing");
            Next::Requeue(self.config.requeue_error)
        } else {
            error!(error = %err, class = %err.class(), "reconcile failed");
            Next::AwaitChange
        }
    }

    /// Reconcile owners named on `rx` until every sender is gone. Keys
    /// already waiting in the queue are coalesced, and each key has at most
    /// one delayed requeue outstanding (the earliest one wins). Requeues are
    /// sent back through `tx`.
    pub async fn run(self: Arc<Self>, tx: mpsc::Sender<ObjectKey>, mut rx: mpsc::Receiver<ObjectKey>) {
        let weak = tx.downgrade();
        drop(tx);
        let timers: Timers = Arc::new(Mutex::new(FxHashMap::default()));
        let mut queue = WorkQueue::default();
        loop {
            if queue.is_empty() {
                match rx.recv().await {
                    Some(key) => queue.push(key),
                    None => break,
                }
            }
            while let Ok(key) = rx.try_recv() {
                queue.push(key);
            }
            let Some(key) = queue.pop() else { continue };
            let owner = match self.store.get(&key).await {
                Ok(Some(o)) => o,
                Ok(None) => {
                    debug!(key = %key, "owner gone");
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "reading owner failed");
                    schedule(&timers, &weak, key, self.config.requeue_error);
                    continue;
                }
            };
            let next = match self.reconcile(&owner).await {
                Ok(next) => next,
                Err(e) => self.error_policy(&e),
            };
            if let Next::Requeue(after) = next {
                schedule(&timers, &weak, key, after);
            }
        }
        info!("controller stopped");
    }
}

/// Due time of the outstanding requeue per key.
type Timers = Arc<Mutex<FxHashMap<ObjectKey, Instant>>>;

/// FIFO of keys waiting for a pass; a key is queued at most once.
#[derive(Default)]
struct WorkQueue {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
}

impl WorkQueue {
    fn push(&mut self, key: ObjectKey) {
        if self.queued.insert(key.clone()) {
            self.order.push_back(key);
        }
    }

    fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn lock_timers(timers: &Timers) -> MutexGuard<'_, FxHashMap<ObjectKey, Instant>> {
    timers.lock().unwrap_or_else(|e| e.into_inner())
}

/// Arm a requeue of `key` after `after`, unless one at least as early is
/// already armed. A superseded timer fires into nothing.
fn schedule(timers: &Timers, tx: &mpsc::WeakSender<ObjectKey>, key: ObjectKey, after: Duration) {
    let due = Instant::now() + after;
    {
        let mut armed = lock_timers(timers);
        if armed.get(&key).is_some_and(|at| *at <= due) {
            debug!(key = %key, "requeue already pending");
            return;
        }
        armed.insert(key.clone(), due);
    }
    let timers = timers.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep_until(due).await;
        {
            let mut armed = lock_timers(&timers);
            if armed.get(&key) != Some(&due) {
                return;
            }
            armed.remove(&key);
        }
        if let Some(tx) = tx.upgrade() {
            let _ = tx.send(key).await;
        }
    });
}
