use keel_core::{Classify, ErrorClass, ObjectKey, StoreError, StoreOp};

/// A producer could not compute the desired object.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("{0}")]
    Failed(String),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ProducerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("unknown kind {0}; register it in the kind registry")]
    UnknownKind(String),

    #[error("{key}: producer failed: {source}")]
    Producer {
        key: ObjectKey,
        #[source]
        source: ProducerError,
    },

    /// Producer output lost or changed its identity (name, namespace, kind).
    #[error("{key}: malformed producer output: {reason}")]
    Identity { key: ObjectKey, reason: String },

    #[error("{key}: ownership: {reason}")]
    Ownership { key: ObjectKey, reason: String },

    #[error("{key}: {op} failed: {source}")]
    Store {
        key: ObjectKey,
        op: StoreOp,
        #[source]
        source: StoreError,
    },

    #[error("{key}: still conflicting after {attempts} attempts: {last}")]
    ConflictExhausted { key: ObjectKey, attempts: u32, last: StoreError },

    #[error("{key}: {op} timed out")]
    TimedOut { key: ObjectKey, op: StoreOp },

    #[error("{key}: object codec: {source}")]
    Codec {
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },
}

impl ReconcileError {
    /// Object the error is about, when there is one.
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            ReconcileError::UnknownKind(_) => None,
            ReconcileError::Producer { key, .. }
            | ReconcileError::Identity { key, .. }
            | ReconcileError::Ownership { key, .. }
            | ReconcileError::Store { key, .. }
            | ReconcileError::ConflictExhausted { key, .. }
            | ReconcileError::TimedOut { key, .. }
            | ReconcileError::Codec { key, .. } => Some(key),
        }
    }
}

impl Classify for ReconcileError {
    fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::UnknownKind(_)
            | ReconcileError::Producer { .. }
            | ReconcileError::Identity { .. }
            | ReconcileError::Ownership { .. }
            | ReconcileError::Codec { .. } => ErrorClass::FatalLocal,
            ReconcileError::Store { source, .. } => source.class(),
            ReconcileError::ConflictExhausted { .. } => ErrorClass::ExhaustedRetry,
            ReconcileError::TimedOut { .. } => ErrorClass::TransientRetryable,
        }
    }
}
