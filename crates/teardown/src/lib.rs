//! Keel teardown: finalizer-driven deletion of a managed cluster's
//! externally provisioned resources (load balancers, volumes, machines,
//! credentials), one ordered step per finalizer marker.

#![forbid(unsafe_code)]

pub mod condition;
pub mod orchestrator;
pub mod step;
pub mod steps;

pub use condition::{condition_status, set_condition, CLEANUP_BLOCKED, CLEANUP_PENDING};
pub use orchestrator::{CleanupError, CleanupOutcome, CleanupState, Orchestrator, OrchestratorConfig};
pub use step::{FinalizerStep, StepError, StepStatus};
pub use steps::{DeleteAndWait, Target};

/// Load balancers created by in-cluster `LoadBalancer` services.
pub const CLEANUP_IN_CLUSTER_LB: &str = "kubermatic.io/cleanup-in-cluster-lb";
/// Volumes provisioned for in-cluster claims.
pub const CLEANUP_IN_CLUSTER_PV: &str = "kubermatic.io/cleanup-in-cluster-pv";
pub const DELETE_NODES: &str = "kubermatic.io/delete-nodes";
pub const CLEANUP_CREDENTIALS_SECRETS: &str = "kubermatic.io/cleanup-credentials-secrets";

/// Default teardown order.
pub const STANDARD_ORDER: [&str; 4] =
    [CLEANUP_IN_CLUSTER_LB, CLEANUP_IN_CLUSTER_PV, DELETE_NODES, CLEANUP_CREDENTIALS_SECRETS];
