//! Blueprints: what to ensure for an owner, and in which order.

use std::sync::Arc;

use keel_apply::NamedProducer;
use kube::core::DynamicObject;

type ProducerSet = Arc<dyn Fn(&DynamicObject) -> Vec<NamedProducer> + Send + Sync>;
type NamespaceFn = Arc<dyn Fn(&DynamicObject) -> String + Send + Sync>;

/// Where a blueprint's objects live.
#[derive(Clone)]
pub enum Placement {
    ClusterScoped,
    Namespace(String),
    /// Derived from the owner, e.g. `cluster-<name>`.
    PerOwner(NamespaceFn),
}

impl Placement {
    pub fn per_owner(f: impl Fn(&DynamicObject) -> String + Send + Sync + 'static) -> Self {
        Placement::PerOwner(Arc::new(f))
    }

    pub fn namespace_for(&self, owner: &DynamicObject) -> Option<String> {
        match self {
            Placement::ClusterScoped => None,
            Placement::Namespace(ns) => Some(ns.clone()),
            Placement::PerOwner(f) => Some(f(owner)),
        }
    }
}

/// One group of same-kind objects, built per owner.
#[derive(Clone)]
pub struct Blueprint {
    pub id: String,
    /// Kind registry key, e.g. `v1/Secret`.
    pub kind: String,
    pub placement: Placement,
    pub depends_on: Vec<String>,
    producers: ProducerSet,
}

impl std::fmt::Debug for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blueprint")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

impl Blueprint {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        placement: Placement,
        producers: impl Fn(&DynamicObject) -> Vec<NamedProducer> + Send + Sync + 'static,
    ) -> Self {
        Self { id: id.into(), kind: kind.into(), placement, depends_on: Vec::new(), producers: Arc::new(producers) }
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn producers_for(&self, owner: &DynamicObject) -> Vec<NamedProducer> {
        (self.producers)(owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlueprintError {
    #[error("duplicate blueprint id {0}")]
    Duplicate(String),
    #[error("blueprint {id} depends on unknown blueprint {missing}")]
    UnknownDependency { id: String, missing: String },
    #[error("dependency cycle among {0:?}")]
    Cycle(Vec<String>),
}

/// Topological order, stable with respect to declaration order: among the
/// blueprints whose dependencies are satisfied, the first declared goes next.
pub fn order(blueprints: Vec<Blueprint>) -> Result<Vec<Blueprint>, BlueprintError> {
    for (i, bp) in blueprints.iter().enumerate() {
        if blueprints[..i].iter().any(|b| b.id == bp.id) {
            return Err(BlueprintError::Duplicate(bp.id.clone()));
        }
        if let Some(missing) = bp.depends_on.iter().find(|d| !blueprints.iter().any(|b| &b.id == *d)) {
            return Err(BlueprintError::UnknownDependency { id: bp.id.clone(), missing: missing.clone() });
        }
    }
    let mut pending: Vec<Option<Blueprint>> = blueprints.into_iter().map(Some).collect();
    let mut out: Vec<Blueprint> = Vec::with_capacity(pending.len());
    while out.len() < pending.len() {
        let next = pending.iter().position(|slot| {
            slot.as_ref().is_some_and(|bp| bp.depends_on.iter().all(|d| out.iter().any(|done| &done.id == d)))
        });
        match next.and_then(|i| pending[i].take()) {
            Some(bp) => out.push(bp),
            None => {
                let stuck = pending.iter().flatten().map(|bp| bp.id.clone()).collect();
                return Err(BlueprintError::Cycle(stuck));
            }
        }
    }
    Ok(out)
}
