//! Built-in cleanup steps over the managed cluster's own store.
//!
//! Each step lists what it is responsible for, deletes what is not already
//! going away, and reports `Pending` until nothing is left. Running it again
//! after completion finds nothing and reports `Done`.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Secret, Service};
use keel_core::{is_terminating, pointer_get, ObjectKey, ObjectStore, ResourceKind};
use kube::core::DynamicObject;
use tracing::{debug, info};

use crate::step::{FinalizerStep, StepError, StepStatus};
use crate::{CLEANUP_CREDENTIALS_SECRETS, CLEANUP_IN_CLUSTER_LB, CLEANUP_IN_CLUSTER_PV, DELETE_NODES};

type Filter = Arc<dyn Fn(&DynamicObject, &DynamicObject) -> bool + Send + Sync>;

/// A set of objects one step is responsible for.
#[derive(Clone)]
pub struct Target {
    pub kind: ResourceKind,
    /// `None` lists across all namespaces.
    pub namespace: Option<String>,
    /// Wait for these to disappear without deleting them; something else
    /// (a provisioner, a controller) removes them.
    pub wait_only: bool,
    filter: Filter,
}

impl Target {
    /// Every object of `kind`.
    pub fn all(kind: ResourceKind, namespace: Option<&str>) -> Self {
        Self { kind, namespace: namespace.map(str::to_string), wait_only: false, filter: Arc::new(|_: &DynamicObject, _: &DynamicObject| true) }
    }

    /// Objects of `kind` for which `filter(owner, obj)` holds.
    pub fn matching(
        kind: ResourceKind,
        namespace: Option<&str>,
        filter: impl Fn(&DynamicObject, &DynamicObject) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self { filter: Arc::new(filter), ..Self::all(kind, namespace) }
    }

    pub fn wait_only(mut self) -> Self {
        self.wait_only = true;
        self
    }
}

/// Delete every target object and wait until all of them are gone.
pub struct DeleteAndWait {
    marker: String,
    store: Arc<dyn ObjectStore>,
    targets: Vec<Target>,
}

impl DeleteAndWait {
    pub fn new(marker: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self { marker: marker.into(), store, targets: Vec::new() }
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    /// Services of type `LoadBalancer`; deleting them releases the cloud
    /// load balancers.
    pub fn load_balancers(store: Arc<dyn ObjectStore>) -> Self {
        Self::new(CLEANUP_IN_CLUSTER_LB, store).target(Target::matching(ResourceKind::of::<Service>(), None, |_, svc| {
            pointer_get(&svc.data, "/spec/type").and_then(|t| t.as_str()) == Some("LoadBalancer")
        }))
    }

    /// Claims first, then wait for the bound volumes to be released by
    /// their provisioner.
    pub fn volumes(store: Arc<dyn ObjectStore>) -> Self {
        Self::new(CLEANUP_IN_CLUSTER_PV, store)
            .target(Target::all(ResourceKind::of::<PersistentVolumeClaim>(), None))
            .target(
                Target::matching(ResourceKind::of::<PersistentVolume>(), None, |_, pv| {
                    pointer_get(&pv.data, "/spec/claimRef").is_some()
                })
                .wait_only(),
            )
    }

    /// Cluster-API machines in `kube-system`, outermost controller first.
    pub fn nodes(store: Arc<dyn ObjectStore>) -> Self {
        let capi = |kind: &str, plural: &str| ResourceKind::new("cluster.k8s.io", "v1alpha1", kind, plural, true);
        Self::new(DELETE_NODES, store)
            .target(Target::all(capi("MachineDeployment", "machinedeployments"), Some("kube-system")))
            .target(Target::all(capi("MachineSet", "machinesets"), Some("kube-system")))
            .target(Target::all(capi("Machine", "machines"), Some("kube-system")))
    }

    /// Provider credential secrets named `credential-<provider>-<owner>` in
    /// `namespace`.
    pub fn credential_secrets(store: Arc<dyn ObjectStore>, namespace: &str) -> Self {
        Self::new(CLEANUP_CREDENTIALS_SECRETS, store).target(Target::matching(
            ResourceKind::of::<Secret>(),
            Some(namespace),
            |owner, secret| {
                let (Some(owner), Some(name)) = (owner.metadata.name.as_deref(), secret.metadata.name.as_deref()) else {
                    return false;
                };
                name.starts_with("credential-") && name.ends_with(&format!("-{owner}"))
            },
        ))
    }

    async fn drain(&self, owner: &DynamicObject, target: &Target) -> Result<usize, StepError> {
        let objects = self.store.list(&target.kind, target.namespace.as_deref()).await?;
        let mut remaining = 0usize;
        for obj in objects.iter().filter(|o| (target.filter)(owner, *o)) {
            remaining += 1;
            if target.wait_only || is_terminating(obj) {
                continue;
            }
            let Some(key) = ObjectKey::of(&target.kind, obj) else { continue };
            match self.store.delete(&key).await {
                Ok(()) => info!(marker = %self.marker, key = %key, "deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(remaining)
    }
}

#[async_trait]
impl FinalizerStep for DeleteAndWait {
    fn marker(&self) -> &str {
        &self.marker
    }

    async fn run(&self, owner: &DynamicObject) -> Result<StepStatus, StepError> {
        let mut waiting = Vec::new();
        for target in &self.targets {
            let n = self.drain(owner, target).await?;
            if n > 0 {
                waiting.push(format!("{} {}", n, target.kind.kind));
            }
        }
        if waiting.is_empty() {
            return Ok(StepStatus::Done);
        }
        let detail = format!("waiting for {}", waiting.join(", "));
        debug!(marker = %self.marker, detail = %detail, "objects still present");
        Ok(StepStatus::Pending(detail))
    }
}
