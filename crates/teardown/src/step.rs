use keel_core::{Classify, ErrorClass, StoreError};
use kube::core::DynamicObject;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Cleanup finished durably; the marker may go.
    Done,
    /// Still waiting on something; keep the marker and look again later.
    Pending(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl From<StoreError> for StepError {
    fn from(e: StoreError) -> Self {
        if e.is_retryable() {
            StepError::Transient(e.to_string())
        } else {
            StepError::Permanent(e.to_string())
        }
    }
}

impl Classify for StepError {
    fn class(&self) -> ErrorClass {
        match self {
            StepError::Transient(_) => ErrorClass::TransientRetryable,
            StepError::Permanent(_) => ErrorClass::FatalExternal,
        }
    }
}

/// One ordered piece of teardown guarded by a finalizer marker.
///
/// `run` may be invoked any number of times for the same owner, including
/// after it already reported `Done` (the marker removal can fail), so it
/// must be idempotent.
#[async_trait::async_trait]
pub trait FinalizerStep: Send + Sync {
    fn marker(&self) -> &str;

    async fn run(&self, owner: &DynamicObject) -> Result<StepStatus, StepError>;
}
