//! Resource kinds and the per-kind reconciliation capability registry.
//!
//! A kind is addressed by its G/V/K key (`v1/Secret`, `apps/v1/Deployment`).
//! The registry maps that key to a [`KindSpec`], which tells the engine which
//! fields the store assigns and which fields can never be updated in place.

use std::any::TypeId;

use kube::core::ApiResource;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::object::ObjectKey;

/// A served Kubernetes resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    /// Kind of a k8s-openapi type.
    pub fn of<K>() -> Self
    where
        K: k8s_openapi::Resource + 'static,
    {
        let namespaced = TypeId::of::<K::Scope>() == TypeId::of::<k8s_openapi::NamespaceResourceScope>();
        Self::new(K::GROUP, K::VERSION, K::KIND, K::URL_PATH_SEGMENT, namespaced)
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// Identity of an object of this kind. The namespace is dropped for
    /// cluster-scoped kinds.
    pub fn key(&self, namespace: Option<&str>, name: &str) -> ObjectKey {
        ObjectKey {
            kind: self.clone(),
            namespace: if self.namespaced { namespace.map(|s| s.to_string()) } else { None },
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Split a G/V/K key into `(group, version, kind)`.
pub fn parse_gvk_key(key: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Some((String::new(), (*version).to_string(), (*kind).to_string())),
        [group, version, kind] => Some(((*group).to_string(), (*version).to_string(), (*kind).to_string())),
        _ => None,
    }
}

/// Per-kind reconciliation capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSpec {
    pub kind: ResourceKind,
    /// JSON pointers the store fills in. Carried from current into desired
    /// when the producer leaves them out.
    pub server_fields: Vec<String>,
    /// JSON pointers that cannot change on update; a change forces
    /// delete + create.
    pub immutable_fields: Vec<String>,
}

impl KindSpec {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, server_fields: Vec::new(), immutable_fields: Vec::new() }
    }

    pub fn with_server_fields(mut self, paths: &[&str]) -> Self {
        self.server_fields.extend(paths.iter().map(|p| p.to_string()));
        self
    }

    pub fn with_immutable_fields(mut self, paths: &[&str]) -> Self {
        self.immutable_fields.extend(paths.iter().map(|p| p.to_string()));
        self
    }

    /// Spec for a k8s-openapi type, including the built-in field lists.
    pub fn of<K>() -> Self
    where
        K: k8s_openapi::Resource + 'static,
    {
        let kind = ResourceKind::of::<K>();
        let (server, immutable) = builtin_fields_for(&kind.group, &kind.version, &kind.kind);
        Self::new(kind).with_server_fields(server).with_immutable_fields(immutable)
    }
}

fn builtin_fields_for(group: &str, version: &str, kind: &str) -> (&'static [&'static str], &'static [&'static str]) {
    match (group, version, kind) {
        ("", "v1", "Service") => (
            &["/spec/clusterIP", "/spec/clusterIPs", "/spec/ipFamilies", "/spec/ipFamilyPolicy", "/spec/healthCheckNodePort"],
            &[],
        ),
        ("", "v1", "ServiceAccount") => (&["/secrets"], &[]),
        ("", "v1", "PersistentVolumeClaim") => (&["/spec/volumeName"], &["/spec/storageClassName", "/spec/accessModes"]),
        ("apps", "v1", "Deployment") | ("apps", "v1", "DaemonSet") => (&[], &["/spec/selector"]),
        ("apps", "v1", "StatefulSet") => (&[], &["/spec/selector", "/spec/serviceName", "/spec/volumeClaimTemplates"]),
        ("batch", "v1", "Job") => (&["/spec/selector"], &["/spec/completions"]),
        ("rbac.authorization.k8s.io", "v1", "RoleBinding") | ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding") => {
            (&[], &["/roleRef"])
        }
        _ => (&[], &[]),
    }
}

/// Kind tag -> capability.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: FxHashMap<String, KindSpec>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the kinds managed-cluster blueprints produce.
    pub fn builtin() -> Self {
        use k8s_openapi::api::{apps, batch, core, networking, policy, rbac};
        let mut reg = Self::new();
        reg.register(KindSpec::of::<core::v1::Secret>());
        reg.register(KindSpec::of::<core::v1::ConfigMap>());
        reg.register(KindSpec::of::<core::v1::Service>());
        reg.register(KindSpec::of::<core::v1::ServiceAccount>());
        reg.register(KindSpec::of::<core::v1::Namespace>());
        reg.register(KindSpec::of::<core::v1::PersistentVolumeClaim>());
        reg.register(KindSpec::of::<apps::v1::Deployment>());
        reg.register(KindSpec::of::<apps::v1::StatefulSet>());
        reg.register(KindSpec::of::<apps::v1::DaemonSet>());
        reg.register(KindSpec::of::<rbac::v1::Role>());
        reg.register(KindSpec::of::<rbac::v1::RoleBinding>());
        reg.register(KindSpec::of::<rbac::v1::ClusterRole>());
        reg.register(KindSpec::of::<rbac::v1::ClusterRoleBinding>());
        reg.register(KindSpec::of::<networking::v1::Ingress>());
        reg.register(KindSpec::of::<networking::v1::NetworkPolicy>());
        reg.register(KindSpec::of::<policy::v1::PodDisruptionBudget>());
        reg.register(KindSpec::of::<batch::v1::Job>());
        reg.register(KindSpec::of::<batch::v1::CronJob>());
        reg
    }

    /// Add or replace the spec for its kind key.
    pub fn register(&mut self, spec: KindSpec) -> &mut Self {
        self.kinds.insert(spec.kind.gvk_key(), spec);
        self
    }

    pub fn get(&self, gvk_key: &str) -> Option<&KindSpec> {
        self.kinds.get(gvk_key)
    }

    /// Registered spec for `K`, or the built-in default when not registered.
    pub fn spec_for<K>(&self) -> KindSpec
    where
        K: k8s_openapi::Resource + 'static,
    {
        let kind = ResourceKind::of::<K>();
        self.kinds.get(&kind.gvk_key()).cloned().unwrap_or_else(KindSpec::of::<K>)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Secret, rbac::v1::ClusterRole};

    #[test]
    fn kind_of_typed_resources() {
        let s = ResourceKind::of::<Secret>();
        assert_eq!(s.gvk_key(), "v1/Secret");
        assert_eq!(s.plural, "secrets");
        assert!(s.namespaced);

        let cr = ResourceKind::of::<ClusterRole>();
        assert_eq!(cr.gvk_key(), "rbac.authorization.k8s.io/v1/ClusterRole");
        assert_eq!(cr.api_version(), "rbac.authorization.k8s.io/v1");
        assert!(!cr.namespaced);
    }

    #[test]
    fn cluster_scoped_keys_drop_namespace() {
        let cr = ResourceKind::of::<ClusterRole>();
        assert_eq!(cr.key(Some("kube-system"), "admin").namespace, None);
        let s = ResourceKind::of::<Secret>();
        assert_eq!(s.key(Some("kube-system"), "x").namespace.as_deref(), Some("kube-system"));
    }

    #[test]
    fn builtin_registry_carries_field_lists() {
        let reg = KindRegistry::builtin();
        let sts = reg.get("apps/v1/StatefulSet").unwrap();
        assert!(sts.immutable_fields.iter().any(|p| p == "/spec/selector"));
        let svc = reg.get("v1/Service").unwrap();
        assert!(svc.server_fields.iter().any(|p| p == "/spec/clusterIP"));
        assert!(reg.get("v1/Pod").is_none());
        assert_eq!(reg.spec_for::<StatefulSet>().kind.plural, "statefulsets");
    }

    #[test]
    fn gvk_keys_parse() {
        assert_eq!(parse_gvk_key("v1/Secret"), Some((String::new(), "v1".into(), "Secret".into())));
        assert_eq!(
            parse_gvk_key("apps/v1/Deployment"),
            Some(("apps".into(), "v1".into(), "Deployment".into()))
        );
        assert_eq!(parse_gvk_key("Secret"), None);
    }
}
