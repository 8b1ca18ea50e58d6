//! Finalizer-ordered deletion.
//!
//! While an owner is being deleted, the first configured marker still on it
//! (in declared order) has its step invoked. A step that reports `Done` gets
//! its marker removed; anything else leaves the marker in place. The owner
//! itself is never deleted here. Progress is recorded on the owner's
//! `status.conditions` through the status write path.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    env_or, has_finalizer, is_terminating, Classify, ConflictPolicy, ErrorClass, ObjectKey,
    ObjectStore, ResourceKind, StoreError, StoreOp,
};
use kube::core::DynamicObject;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::condition::{condition_status, set_condition, CLEANUP_BLOCKED, CLEANUP_PENDING};
use crate::step::{FinalizerStep, StepError, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub conflict: ConflictPolicy,
    /// Bound on one step invocation and on each owner write.
    pub step_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { conflict: ConflictPolicy::default(), step_timeout: Duration::from_millis(60_000) }
    }
}

impl OrchestratorConfig {
    /// `KEEL_CONFLICT_*` plus `KEEL_CLEANUP_STEP_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self {
            conflict: ConflictPolicy::from_env(),
            step_timeout: Duration::from_millis(env_or("KEEL_CLEANUP_STEP_TIMEOUT_MS", 60_000u64)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupState {
    /// Not being deleted.
    Active,
    /// Configured markers remain.
    Draining,
    /// No configured markers remain.
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub state: CleanupState,
    /// All configured markers are gone.
    pub done: bool,
    /// A marker was removed during this call; look again right away.
    pub progressed: bool,
    /// Marker whose step is pending.
    pub blocking: Option<String>,
}

impl CleanupOutcome {
    fn active() -> Self {
        Self { state: CleanupState::Active, done: false, progressed: false, blocking: None }
    }

    fn terminal() -> Self {
        Self { state: CleanupState::Terminal, done: true, progressed: false, blocking: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("owner has no name")]
    InvalidOwner,

    #[error("{marker}: {source}")]
    Step {
        marker: String,
        #[source]
        source: StepError,
    },

    #[error("{marker}: step timed out after {after:?}")]
    StepTimedOut { marker: String, after: Duration },

    #[error("{key}: {op} failed: {source}")]
    Store {
        key: ObjectKey,
        op: StoreOp,
        #[source]
        source: StoreError,
    },

    #[error("{key}: {op} timed out")]
    TimedOut { key: ObjectKey, op: StoreOp },

    #[error("{key}: owner update still conflicting after {attempts} attempts")]
    ConflictExhausted { key: ObjectKey, attempts: u32 },
}

impl CleanupError {
    /// Marker whose step failed, if the error came from a step.
    pub fn marker(&self) -> Option<&str> {
        match self {
            CleanupError::Step { marker, .. } | CleanupError::StepTimedOut { marker, .. } => Some(marker),
            _ => None,
        }
    }
}

impl Classify for CleanupError {
    fn class(&self) -> ErrorClass {
        match self {
            CleanupError::InvalidOwner => ErrorClass::FatalLocal,
            CleanupError::Step { source, .. } => source.class(),
            CleanupError::StepTimedOut { .. } | CleanupError::TimedOut { .. } => ErrorClass::TransientRetryable,
            CleanupError::Store { source, .. } => source.class(),
            CleanupError::ConflictExhausted { .. } => ErrorClass::ExhaustedRetry,
        }
    }
}

/// Which part of the owner a read-modify-write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerWrite {
    Object,
    Status,
}

pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ObjectStore>, config: OrchestratorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Active path: put every missing marker on the owner, in `markers`
    /// order, with a single write. Terminating owners are left alone.
    pub async fn ensure_finalizers(
        &self,
        owner_kind: &ResourceKind,
        owner: &DynamicObject,
        markers: &[&str],
    ) -> Result<DynamicObject, CleanupError> {
        if is_terminating(owner) || markers.iter().all(|m| has_finalizer(owner, m)) {
            return Ok(owner.clone());
        }
        let key = ObjectKey::of(owner_kind, owner).ok_or(CleanupError::InvalidOwner)?;
        let updated = self
            .update_owner(&key, OwnerWrite::Object, |o| {
                if is_terminating(o) {
                    return false;
                }
                let mut changed = false;
                let fins = o.metadata.finalizers.get_or_insert_with(Vec::new);
                for m in markers {
                    if !fins.iter().any(|f| f == m) {
                        fins.push(m.to_string());
                        changed = true;
                    }
                }
                changed
            })
            .await?;
        if updated.is_some() {
            info!(key = %key, markers = ?markers, "finalizers ensured");
        }
        Ok(updated.unwrap_or_else(|| owner.clone()))
    }

    /// One pass of the deletion state machine over `owner`.
    pub async fn cleanup(
        &self,
        owner_kind: &ResourceKind,
        owner: &DynamicObject,
        steps: &[Arc<dyn FinalizerStep>],
    ) -> Result<CleanupOutcome, CleanupError> {
        if !is_terminating(owner) {
            return Ok(CleanupOutcome::active());
        }
        let key = ObjectKey::of(owner_kind, owner).ok_or(CleanupError::InvalidOwner)?;
        let Some(step) = steps.iter().find(|s| has_finalizer(owner, s.marker())) else {
            debug!(key = %key, "no cleanup markers left");
            return Ok(CleanupOutcome::terminal());
        };
        let marker = step.marker().to_string();

        let result = match tokio::time::timeout(self.config.step_timeout, step.run(owner)).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(source)) => Err(CleanupError::Step { marker: marker.clone(), source }),
            Err(_) => Err(CleanupError::StepTimedOut { marker: marker.clone(), after: self.config.step_timeout }),
        };

        match result {
            Ok(StepStatus::Pending(detail)) => {
                counter!("cleanup_step_pending", 1u64);
                let message = format!("{marker}: {detail}");
                match self
                    .update_owner(&key, OwnerWrite::Status, |o| {
                        set_condition(o, CLEANUP_PENDING, true, "FinalizerStepPending", &message)
                    })
                    .await
                {
                    Ok(Some(_)) => info!(key = %key, marker = %marker, detail = %detail, "cleanup waiting on step"),
                    Ok(None) => debug!(key = %key, marker = %marker, detail = %detail, "cleanup step pending"),
                    Err(e) => warn!(key = %key, error = %e, "recording CleanupPending failed"),
                }
                Ok(CleanupOutcome {
                    state: CleanupState::Draining,
                    done: false,
                    progressed: false,
                    blocking: Some(marker),
                })
            }
            Ok(StepStatus::Done) => {
                counter!("cleanup_step_done", 1u64);
                let cleared = self
                    .update_owner(&key, OwnerWrite::Status, |o| {
                        let mut changed = false;
                        for type_ in [CLEANUP_BLOCKED, CLEANUP_PENDING] {
                            if condition_status(o, type_) == Some("True") {
                                changed |= set_condition(o, type_, false, "FinalizerStepCompleted", &marker);
                            }
                        }
                        changed
                    })
                    .await;
                if let Err(e) = cleared {
                    warn!(key = %key, marker = %marker, error = %e, "clearing cleanup conditions failed");
                }
                let removed = self
                    .update_owner(&key, OwnerWrite::Object, |o| {
                        let before = o.metadata.finalizers.as_ref().map_or(0, Vec::len);
                        if let Some(fins) = o.metadata.finalizers.as_mut() {
                            fins.retain(|f| f != &marker);
                        }
                        o.metadata.finalizers.as_ref().map_or(0, Vec::len) != before
                    })
                    .await?;
                if removed.is_some() {
                    counter!("finalizer_removed", 1u64);
                }
                info!(key = %key, marker = %marker, "cleanup step done; marker removed");
                Ok(CleanupOutcome { state: CleanupState::Draining, done: false, progressed: true, blocking: None })
            }
            Err(err) => {
                counter!("cleanup_step_err", 1u64);
                warn!(key = %key, marker = %marker, error = %err, "cleanup step failed");
                let message = err.to_string();
                if let Err(e) = self
                    .update_owner(&key, OwnerWrite::Status, |o| {
                        set_condition(o, CLEANUP_BLOCKED, true, "FinalizerStepFailed", &message)
                    })
                    .await
                {
                    warn!(key = %key, error = %e, "recording CleanupBlocked failed");
                }
                Err(err)
            }
        }
    }

    /// Read-modify-write of the owner with conflict retry. `edit` returns
    /// whether it changed anything; `None` means no write happened (owner
    /// gone or already in the wanted shape).
    async fn update_owner(
        &self,
        key: &ObjectKey,
        write: OwnerWrite,
        edit: impl Fn(&mut DynamicObject) -> bool,
    ) -> Result<Option<DynamicObject>, CleanupError> {
        let attempts = self.config.conflict.attempts();
        let op = match write {
            OwnerWrite::Object => StoreOp::Update,
            OwnerWrite::Status => StoreOp::UpdateStatus,
        };
        for attempt in 1..=attempts {
            let current = self.bounded(key, StoreOp::Get, self.store.get(key)).await?;
            let Some(mut obj) = current else { return Ok(None) };
            if !edit(&mut obj) {
                return Ok(None);
            }
            let written = match write {
                OwnerWrite::Object => self.store.update(&key.kind, &obj),
                OwnerWrite::Status => self.store.update_status(&key.kind, &obj),
            };
            match tokio::time::timeout(self.config.step_timeout, written).await {
                Err(_) => return Err(CleanupError::TimedOut { key: key.clone(), op }),
                Ok(Ok(updated)) => return Ok(Some(updated)),
                Ok(Err(e)) if e.is_conflict() => {
                    debug!(key = %key, op = %op, attempt, "owner write conflicted");
                    if attempt < attempts {
                        self.config.conflict.pause().await;
                    }
                }
                Ok(Err(e)) if e.is_not_found() => return Ok(None),
                Ok(Err(source)) => return Err(CleanupError::Store { key: key.clone(), op, source }),
            }
        }
        Err(CleanupError::ConflictExhausted { key: key.clone(), attempts })
    }

    async fn bounded<T>(
        &self,
        key: &ObjectKey,
        op: StoreOp,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, CleanupError> {
        tokio::time::timeout(self.config.step_timeout, fut)
            .await
            .map_err(|_| CleanupError::TimedOut { key: key.clone(), op })?
            .map_err(|source| CleanupError::Store { key: key.clone(), op, source })
    }
}
