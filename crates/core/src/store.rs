//! Object store capability consumed by the engine and the orchestrator.

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::error::{Classify, ErrorClass};
use crate::kinds::ResourceKind;
use crate::object::ObjectKey;

/// Store operation, used to annotate errors with the step that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
    List,
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StoreOp::Get => "get",
            StoreOp::Create => "create",
            StoreOp::Update => "update",
            StoreOp::UpdateStatus => "update_status",
            StoreOp::Delete => "delete",
            StoreOp::List => "list",
        };
        f.write_str(s)
    }
}

/// Store errors suitable for classification by callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    /// Stale `resourceVersion` on update.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Conflict or create race; both mean a fresher object is available.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Conflict(_)
            | StoreError::Unavailable(_) => ErrorClass::TransientRetryable,
            StoreError::Forbidden(_) => ErrorClass::FatalExternal,
            StoreError::Invalid(_) => ErrorClass::FatalLocal,
        }
    }
}

/// Get/create/update/delete/list on named, namespaced, typed objects.
///
/// Every returned object carries a store-assigned `resourceVersion`; `update`
/// rejects a stale one with [`StoreError::Conflict`]. `delete` on an object
/// with finalizers only marks it (sets `deletionTimestamp`). Kinds that serve
/// `status` as a subresource ignore it on `update`; `update_status` writes
/// only `status`, under the same `resourceVersion` precondition.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn update_status(&self, kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError>;
}
