//! Keel apply: the declarative reconciliation engine.
//!
//! `Engine::ensure` drives one object toward the output of a producer with
//! optimistic concurrency on `resourceVersion`, conflict retry, owner
//! reference injection and per-kind handling of server-assigned and
//! immutable fields.

#![forbid(unsafe_code)]

pub mod diff;
pub mod engine;
pub mod error;
pub mod ownership;
pub mod producer;

pub use diff::{diff_summary, DiffSummary};
pub use engine::{Engine, EngineConfig, EnsureAction, EnsureOutcome};
pub use error::{ProducerError, ReconcileError};
pub use ownership::{merge_owner_references, OwnerSpec};
pub use producer::{annotations, from_dynamic, labels, to_dynamic, Modifier, NamedProducer, Producer};
