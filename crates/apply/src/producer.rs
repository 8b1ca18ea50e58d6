//! Desired-state producers and the modifiers wrapped around them.
//!
//! A producer is a pure function from the current object (or a zero value
//! when nothing exists yet) to the desired object. Configuration reaches it
//! through closure captures, never through shared mutable state.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ProducerError;

type ProduceFn = dyn Fn(DynamicObject) -> Result<DynamicObject, ProducerError> + Send + Sync;

/// Post-processing applied to a producer's output.
pub type Modifier = Arc<ProduceFn>;

#[derive(Clone)]
pub struct Producer {
    f: Arc<ProduceFn>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Producer")
    }
}

impl Producer {
    pub fn new(f: impl Fn(DynamicObject) -> Result<DynamicObject, ProducerError> + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }

    /// Producer over a typed k8s-openapi resource. The zero value handed to
    /// it for a missing object is `K::default()` with identity set.
    pub fn typed<K, F>(f: F) -> Self
    where
        K: k8s_openapi::Metadata<Ty = ObjectMeta> + Serialize + DeserializeOwned + Default + 'static,
        F: Fn(K) -> Result<K, ProducerError> + Send + Sync + 'static,
    {
        Self::new(move |current: DynamicObject| {
            let input: K = if current.metadata.resource_version.is_none() {
                let mut k = K::default();
                *k.metadata_mut() = current.metadata.clone();
                k
            } else {
                from_dynamic(&current)?
            };
            Ok(to_dynamic(&f(input)?)?)
        })
    }

    pub fn produce(&self, current: DynamicObject) -> Result<DynamicObject, ProducerError> {
        (self.f)(current)
    }

    /// Run `modifiers` in order after this producer.
    pub fn with_modifiers(self, modifiers: &[Modifier]) -> Self {
        if modifiers.is_empty() {
            return self;
        }
        let modifiers = modifiers.to_vec();
        Self::new(move |current| {
            let mut out = self.produce(current)?;
            for m in &modifiers {
                out = m(out)?;
            }
            Ok(out)
        })
    }
}

/// A producer bound to the object name it produces.
#[derive(Clone, Debug)]
pub struct NamedProducer {
    pub name: String,
    pub producer: Producer,
}

impl NamedProducer {
    pub fn new(name: impl Into<String>, producer: Producer) -> Self {
        Self { name: name.into(), producer }
    }
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

/// Merge `labels` into the object's labels, overriding equal keys.
pub fn labels(labels: BTreeMap<String, String>) -> Modifier {
    Arc::new(move |mut obj: DynamicObject| {
        obj.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels.clone());
        Ok(obj)
    })
}

/// Merge `annotations` into the object's annotations, overriding equal keys.
pub fn annotations(annotations: BTreeMap<String, String>) -> Modifier {
    Arc::new(move |mut obj: DynamicObject| {
        obj.metadata.annotations.get_or_insert_with(BTreeMap::new).extend(annotations.clone());
        Ok(obj)
    })
}
