use serde::{Deserialize, Serialize};

/// Coarse error classes. The outer controller only needs to know whether to
/// requeue and how loudly to complain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Conflict, unavailable store, deadline not yet reached. Retried in place
    /// (conflicts) or by requeue.
    TransientRetryable,
    /// Programming defect in the blueprint layer (bad producer output,
    /// missing identity). Never retried.
    FatalLocal,
    /// Permanent failure reported by something outside the process, e.g.
    /// permission denied. Needs an operator.
    FatalExternal,
    /// Bounded conflict retries ran out. Requeue with backoff.
    ExhaustedRetry,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientRetryable | ErrorClass::ExhaustedRetry)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::TransientRetryable => "transient",
            ErrorClass::FatalLocal => "fatal-local",
            ErrorClass::FatalExternal => "fatal-external",
            ErrorClass::ExhaustedRetry => "exhausted-retry",
        };
        f.write_str(s)
    }
}

pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}
