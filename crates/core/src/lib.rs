//! Keel core: resource identity, kind registry, the object store capability
//! and the error taxonomy shared by the engine and the orchestrator.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod kinds;
pub mod object;
pub mod retry;
pub mod store;

pub use config::env_or;
pub use error::{Classify, ErrorClass};
pub use kinds::{parse_gvk_key, KindRegistry, KindSpec, ResourceKind};
pub use object::{
    empty_object, finalizers, has_finalizer, is_terminating, pointer_get, pointer_set,
    resource_version, significant, strip_managed, ObjectKey,
};
pub use retry::ConflictPolicy;
pub use store::{ObjectStore, StoreError, StoreOp};

pub mod prelude {
    pub use super::{
        Classify, ConflictPolicy, ErrorClass, KindRegistry, KindSpec, ObjectKey, ObjectStore,
        ResourceKind, StoreError, StoreOp,
    };
    pub use kube::core::DynamicObject;
}
