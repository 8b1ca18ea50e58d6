//! Object identity and envelope helpers over `DynamicObject`.

use kube::core::{DynamicObject, TypeMeta};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::kinds::ResourceKind;

/// `(kind, namespace, name)`; unique key into the object store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key of an existing object. `None` when the object has no name.
    pub fn of(kind: &ResourceKind, obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.as_deref().filter(|n| !n.is_empty())?;
        Some(kind.key(obj.metadata.namespace.as_deref(), name))
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Zero-value object for `key`: type meta and identity set, empty envelope.
pub fn empty_object(key: &ObjectKey) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: key.kind.api_version(), kind: key.kind.kind.clone() }),
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: key.namespace.clone(),
            ..Default::default()
        },
        data: Json::Object(serde_json::Map::new()),
    }
}

/// Drop fields the store or other controllers own so that two objects can be
/// compared on what a producer actually controls.
pub fn strip_managed(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("uid");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("deletionTimestamp");
        meta.remove("deletionGracePeriodSeconds");
        meta.remove("selfLink");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Significant view of an object (see [`strip_managed`]).
pub fn significant(obj: &DynamicObject) -> Result<Json, serde_json::Error> {
    Ok(strip_managed(serde_json::to_value(obj)?))
}

pub fn pointer_get<'a>(v: &'a Json, ptr: &str) -> Option<&'a Json> {
    v.pointer(ptr).filter(|x| !x.is_null())
}

/// Set the value at a JSON pointer, creating intermediate objects. Array
/// segments must already exist. Returns false when the path cannot be built.
pub fn pointer_set(v: &mut Json, ptr: &str, value: Json) -> bool {
    if ptr.is_empty() {
        *v = value;
        return true;
    }
    let Some(rest) = ptr.strip_prefix('/') else { return false };
    let segments: Vec<String> = rest.split('/').map(|s| s.replace("~1", "/").replace("~0", "~")).collect();
    let mut cur = v;
    for (i, seg) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if cur.is_null() {
            *cur = Json::Object(serde_json::Map::new());
        }
        cur = match cur {
            Json::Object(map) => {
                if last {
                    map.insert(seg.clone(), value);
                    return true;
                }
                map.entry(seg.clone()).or_insert(Json::Null)
            }
            Json::Array(arr) => {
                let Ok(idx) = seg.parse::<usize>() else { return false };
                let Some(slot) = arr.get_mut(idx) else { return false };
                if last {
                    *slot = value;
                    return true;
                }
                slot
            }
            _ => return false,
        };
    }
    false
}

pub fn resource_version(obj: &DynamicObject) -> Option<&str> {
    obj.metadata.resource_version.as_deref().filter(|s| !s.is_empty())
}

pub fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

pub fn finalizers(obj: &DynamicObject) -> &[String] {
    obj.metadata.finalizers.as_deref().unwrap_or(&[])
}

pub fn has_finalizer(obj: &DynamicObject, marker: &str) -> bool {
    finalizers(obj).iter().any(|f| f == marker)
}
