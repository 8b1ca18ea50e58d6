//! Controller owner references for engine-created dependents.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_core::ResourceKind;
use kube::core::DynamicObject;

/// The controller reference every dependent must carry, plus the owner's
/// namespace for scope checks.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerSpec {
    pub reference: OwnerReference,
    /// `None` for a cluster-scoped owner.
    pub namespace: Option<String>,
}

impl OwnerSpec {
    /// Controller reference to `owner`. Fails when the owner has not been
    /// persisted yet (no uid) or has no name.
    pub fn controller_of(owner_kind: &ResourceKind, owner: &DynamicObject) -> Result<Self, String> {
        let name = owner.metadata.name.clone().filter(|n| !n.is_empty()).ok_or("owner has no name")?;
        let uid = owner.metadata.uid.clone().filter(|u| !u.is_empty()).ok_or_else(|| format!("owner {name} has no uid"))?;
        Ok(Self {
            reference: OwnerReference {
                api_version: owner_kind.api_version(),
                kind: owner_kind.kind.clone(),
                name,
                uid,
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
            namespace: if owner_kind.namespaced { owner.metadata.namespace.clone() } else { None },
        })
    }

    /// A namespaced owner may only own dependents in its own namespace.
    pub fn check_scope(&self, dependent: &ResourceKind, dependent_ns: Option<&str>) -> Result<(), String> {
        let Some(owner_ns) = self.namespace.as_deref() else { return Ok(()) };
        if !dependent.namespaced {
            return Err(format!(
                "namespaced owner {}/{} cannot own cluster-scoped {}",
                owner_ns, self.reference.name, dependent
            ));
        }
        match dependent_ns {
            Some(ns) if ns == owner_ns => Ok(()),
            other => Err(format!(
                "owner {}/{} cannot own a dependent in namespace {}",
                owner_ns,
                self.reference.name,
                other.unwrap_or("<none>")
            )),
        }
    }
}

fn is_controller(r: &OwnerReference) -> bool {
    r.controller == Some(true)
}

/// Union of `desired` and `current` references by uid, desired first and
/// winning on equal uid, with `expected` injected as controller when absent.
/// References on `current` are never dropped.
pub fn merge_owner_references(
    current: &[OwnerReference],
    desired: &[OwnerReference],
    expected: Option<&OwnerReference>,
) -> Result<Vec<OwnerReference>, String> {
    let mut out: Vec<OwnerReference> = Vec::with_capacity(current.len() + desired.len() + 1);
    for r in desired.iter().chain(current.iter()) {
        if !out.iter().any(|o| o.uid == r.uid) {
            out.push(r.clone());
        }
    }
    if let Some(exp) = expected {
        match out.iter_mut().find(|o| o.uid == exp.uid) {
            Some(found) => {
                found.controller = Some(true);
                if found.block_owner_deletion.is_none() {
                    found.block_owner_deletion = exp.block_owner_deletion;
                }
            }
            None => out.push(exp.clone()),
        }
    }
    let controllers: Vec<&OwnerReference> = out.iter().filter(|r| is_controller(r)).collect();
    if controllers.len() > 1 {
        let names: Vec<String> = controllers.iter().map(|r| format!("{} {} ({})", r.kind, r.name, r.uid)).collect();
        return Err(format!("more than one controller reference: {}", names.join(", ")));
    }
    Ok(out)
}
