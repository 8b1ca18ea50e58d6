#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use keel_apply::{
    labels, Engine, EngineConfig, EnsureAction, NamedProducer, OwnerSpec, Producer, ProducerError, ReconcileError,
};
use keel_core::{
    empty_object, Classify, ConflictPolicy, ErrorClass, KindRegistry, ObjectKey, ObjectStore, ResourceKind,
    StoreError, StoreOp,
};
use keel_store::MemoryStore;
use kube::core::DynamicObject;
use serde_json::json;

const DOCKERCFG: &str = r#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#;

fn secret_kind() -> ResourceKind {
    ResourceKind::of::<Secret>()
}

fn cluster_kind() -> ResourceKind {
    ResourceKind::new("kubermatic.k8s.io", "v1", "Cluster", "clusters", false)
}

fn engine(store: &Arc<MemoryStore>) -> Engine {
    engine_with(store, EngineConfig::default())
}

fn engine_with(store: &Arc<MemoryStore>, config: EngineConfig) -> Engine {
    let store: Arc<dyn ObjectStore> = store.clone();
    Engine::new(store, Arc::new(KindRegistry::builtin()), config)
}

/// Producer for the image pull secret: sets type and payload, leaves
/// everything else on the current object alone.
fn dockercfg_producer() -> Producer {
    Producer::typed(|mut s: Secret| {
        s.type_ = Some("kubernetes.io/dockerconfigjson".into());
        s.data
            .get_or_insert_with(BTreeMap::new)
            .insert(".dockerconfigjson".into(), ByteString(DOCKERCFG.as_bytes().to_vec()));
        Ok(s)
    })
}

async fn stored_cluster(store: &MemoryStore, name: &str) -> DynamicObject {
    store.create(&cluster_kind(), &empty_object(&cluster_kind().key(None, name))).await.unwrap()
}

fn secret_key(ns: &str, name: &str) -> ObjectKey {
    secret_kind().key(Some(ns), name)
}

#[tokio::test]
async fn second_ensure_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let e = engine(&store);

    let first = e.ensure("v1/Secret", "dockercfg", Some("cluster-abc"), &dockercfg_producer()).await.unwrap();
    assert_eq!(first.action, EnsureAction::Created);
    assert_eq!(first.attempts, 1);
    assert_eq!(store.writes(), 1);

    let second = e.ensure("v1/Secret", "dockercfg", Some("cluster-abc"), &dockercfg_producer()).await.unwrap();
    assert_eq!(second.action, EnsureAction::Unchanged);
    assert_eq!(store.writes(), 1);
    assert_eq!(second.object.metadata.resource_version, first.object.metadata.resource_version);
}

#[tokio::test]
async fn dockercfg_update_survives_interleaved_writer() {
    let store = Arc::new(MemoryStore::new());
    let key = secret_key("cluster-abc", "dockercfg");
    let mut existing = empty_object(&key);
    existing.metadata.annotations = Some(BTreeMap::from([("team".to_string(), "infra".to_string())]));
    existing.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "v1".into(),
        kind: "ConfigMap".into(),
        name: "audit".into(),
        uid: "audit-uid".into(),
        controller: None,
        block_owner_deletion: None,
    }]);
    existing.data = json!({ "type": "kubernetes.io/dockerconfigjson", "data": { ".dockerconfigjson": "e30=" } });
    store.create(&secret_kind(), &existing).await.unwrap();

    let k = key.clone();
    store.before_next(StoreOp::Update, move |s| {
        s.edit(&k, |o| {
            o.metadata.labels = Some(BTreeMap::from([("scanned".to_string(), "true".to_string())]));
        })
        .unwrap();
    });

    let out = engine(&store).ensure("v1/Secret", "dockercfg", Some("cluster-abc"), &dockercfg_producer()).await.unwrap();
    assert_eq!(out.action, EnsureAction::Updated);
    assert_eq!(out.attempts, 2);

    let live = store.get(&key).await.unwrap().unwrap();
    let v = serde_json::to_value(&live).unwrap();
    assert_eq!(v["data"][".dockerconfigjson"], "eyJhdXRocyI6eyJyZWdpc3RyeS5leGFtcGxlLmNvbSI6eyJhdXRoIjoiZFhObGNqcHdZWE56In19fQ==");
    assert_eq!(v["metadata"]["labels"]["scanned"], "true");
    assert_eq!(v["metadata"]["annotations"]["team"], "infra");
    assert_eq!(live.metadata.owner_references.as_ref().map(Vec::len), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_compatible_ensures_converge() {
    let store = Arc::new(MemoryStore::new());
    let with_label = |k: &'static str| {
        Producer::new(move |mut o: DynamicObject| {
            o.metadata.labels.get_or_insert_with(BTreeMap::new).insert(k.to_string(), "yes".to_string());
            o.data["data"] = json!({ "token": "dA==" });
            Ok(o)
        })
    };
    let (ea, eb) = (engine(&store), engine(&store));
    let (pa, pb) = (with_label("a"), with_label("b"));
    let ta = tokio::spawn(async move { ea.ensure("v1/Secret", "token", Some("ns"), &pa).await });
    let tb = tokio::spawn(async move { eb.ensure("v1/Secret", "token", Some("ns"), &pb).await });
    let (ra, rb) = futures::join!(ta, tb);
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();

    let live = store.get(&secret_key("ns", "token")).await.unwrap().unwrap();
    let l = live.metadata.labels.unwrap();
    assert_eq!(l.get("a").map(String::as_str), Some("yes"));
    assert_eq!(l.get("b").map(String::as_str), Some("yes"));
}

#[tokio::test]
async fn create_race_falls_back_to_update() {
    let store = Arc::new(MemoryStore::new());
    let key = secret_key("ns", "dockercfg");
    let k = key.clone();
    store.before_next(StoreOp::Create, move |s| {
        let mut other = empty_object(&k);
        other.metadata.labels = Some(BTreeMap::from([("winner".to_string(), "other".to_string())]));
        futures::executor::block_on(s.create(&ResourceKind::of::<Secret>(), &other)).unwrap();
    });

    let out = engine(&store).ensure("v1/Secret", "dockercfg", Some("ns"), &dockercfg_producer()).await.unwrap();
    assert_eq!(out.action, EnsureAction::Updated);
    assert_eq!(out.attempts, 2);
    let labels = out.object.metadata.labels.unwrap();
    assert_eq!(labels["winner"], "other");
}

#[tokio::test]
async fn persistent_conflicts_exhaust_the_budget() {
    let store = Arc::new(MemoryStore::new());
    let key = secret_key("ns", "dockercfg");
    store.create(&secret_kind(), &empty_object(&key)).await.unwrap();
    for i in 0..3 {
        let k = key.clone();
        store.before_next(StoreOp::Update, move |s| {
            s.edit(&k, |o| {
                o.metadata.annotations = Some(BTreeMap::from([("rev".to_string(), i.to_string())]));
            })
            .unwrap();
        });
    }

    let config = EngineConfig { conflict: ConflictPolicy::with_max_attempts(3), ..Default::default() };
    let err = engine_with(&store, config)
        .ensure("v1/Secret", "dockercfg", Some("ns"), &dockercfg_producer())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::ConflictExhausted { attempts: 3, .. }), "{err}");
    assert_eq!(err.class(), ErrorClass::ExhaustedRetry);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn conflict_pause_respects_the_call_deadline() {
    let store = Arc::new(MemoryStore::new());
    let key = secret_key("ns", "dockercfg");
    store.create(&secret_kind(), &empty_object(&key)).await.unwrap();
    let k = key.clone();
    store.before_next(StoreOp::Update, move |s| {
        s.edit(&k, |o| o.metadata.annotations = Some(BTreeMap::from([("rev".to_string(), "1".to_string())])))
            .unwrap();
    });

    let config = EngineConfig {
        conflict: ConflictPolicy { max_attempts: 3, jitter: Duration::from_secs(36_000) },
        timeout: Duration::from_millis(50),
    };
    let started = std::time::Instant::now();
    let err = engine_with(&store, config)
        .ensure("v1/Secret", "dockercfg", Some("ns"), &dockercfg_producer())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::TimedOut { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

struct StuckStore;

#[async_trait::async_trait]
impl ObjectStore for StuckStore {
    async fn get(&self, _key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }
    async fn create(&self, _kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        Ok(obj.clone())
    }
    async fn update(&self, _kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        Ok(obj.clone())
    }
    async fn update_status(&self, _kind: &ResourceKind, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        Ok(obj.clone())
    }
    async fn delete(&self, _key: &ObjectKey) -> Result<(), StoreError> {
        Ok(())
    }
    async fn list(&self, _kind: &ResourceKind, _ns: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn slow_store_times_out() {
    let config = EngineConfig { timeout: Duration::from_millis(50), ..Default::default() };
    let e = Engine::new(Arc::new(StuckStore), Arc::new(KindRegistry::builtin()), config);
    let err = e.ensure("v1/Secret", "dockercfg", Some("ns"), &dockercfg_producer()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::TimedOut { op: StoreOp::Get, .. }), "{err}");
    assert_eq!(err.class(), ErrorClass::TransientRetryable);
}

#[tokio::test]
async fn store_unavailability_is_returned() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next(StoreOp::Get, StoreError::Unavailable("etcd leader lost".into()));
    let err = engine(&store).ensure("v1/Secret", "x", Some("ns"), &dockercfg_producer()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store { op: StoreOp::Get, .. }), "{err}");
    assert!(err.is_retryable());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn malformed_output_and_bad_identity_are_fatal() {
    let store = Arc::new(MemoryStore::new());
    let e = engine(&store);

    let renames = Producer::new(|mut o: DynamicObject| {
        o.metadata.name = Some("something-else".into());
        Ok(o)
    });
    let err = e.ensure("v1/Secret", "dockercfg", Some("ns"), &renames).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Identity { .. }), "{err}");
    assert_eq!(err.class(), ErrorClass::FatalLocal);

    let moves = Producer::new(|mut o: DynamicObject| {
        o.metadata.namespace = Some("kube-system".into());
        Ok(o)
    });
    assert!(matches!(
        e.ensure("v1/Secret", "dockercfg", Some("ns"), &moves).await,
        Err(ReconcileError::Identity { .. })
    ));

    assert!(matches!(
        e.ensure("v1/Secret", "dockercfg", None, &dockercfg_producer()).await,
        Err(ReconcileError::Identity { .. })
    ));
    assert!(matches!(
        e.ensure("v1/Namespace", "cluster-abc", Some("ns"), &Producer::new(Ok)).await,
        Err(ReconcileError::Identity { .. })
    ));
    assert!(matches!(
        e.ensure("example.com/v1/Widget", "w", Some("ns"), &Producer::new(Ok)).await,
        Err(ReconcileError::UnknownKind(_))
    ));

    let fails = Producer::new(|_| Err(ProducerError::failed("missing datacenter")));
    let err = e.ensure("v1/Secret", "dockercfg", Some("ns"), &fails).await.unwrap_err();
    assert!(err.to_string().contains("missing datacenter"), "{err}");
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn owner_reference_is_injected_and_foreign_refs_kept() {
    let store = Arc::new(MemoryStore::new());
    let cluster = stored_cluster(&store, "abc").await;
    let other = stored_cluster(&store, "audit").await;
    let owner = OwnerSpec::controller_of(&cluster_kind(), &cluster).unwrap();
    let e = engine(&store).for_owner(owner.clone());

    let key = secret_key("cluster-abc", "dockercfg");
    let mut existing = empty_object(&key);
    existing.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "kubermatic.k8s.io/v1".into(),
        kind: "Cluster".into(),
        name: "audit".into(),
        uid: other.metadata.uid.clone().unwrap(),
        controller: None,
        block_owner_deletion: None,
    }]);
    store.create(&secret_kind(), &existing).await.unwrap();

    // the producer drops all owner references; they must come back
    let drops_refs = Producer::new(|mut o: DynamicObject| {
        o.metadata.owner_references = None;
        o.data["type"] = json!("Opaque");
        Ok(o)
    });
    let out = e.ensure("v1/Secret", "dockercfg", Some("cluster-abc"), &drops_refs).await.unwrap();
    let refs = out.object.metadata.owner_references.unwrap();
    assert_eq!(refs.len(), 2);
    let ctrl: Vec<&OwnerReference> = refs.iter().filter(|r| r.controller == Some(true)).collect();
    assert_eq!(ctrl.len(), 1);
    assert_eq!(ctrl[0].uid, owner.reference.uid);

    let again = e.ensure("v1/Secret", "dockercfg", Some("cluster-abc"), &drops_refs).await.unwrap();
    assert_eq!(again.action, EnsureAction::Unchanged);
}

#[tokio::test]
async fn foreign_controller_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let cluster = stored_cluster(&store, "abc").await;
    let thief = stored_cluster(&store, "thief").await;
    let key = secret_key("cluster-abc", "dockercfg");
    let mut existing = empty_object(&key);
    existing.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "kubermatic.k8s.io/v1".into(),
        kind: "Cluster".into(),
        name: "thief".into(),
        uid: thief.metadata.uid.clone().unwrap(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    store.create(&secret_kind(), &existing).await.unwrap();

    let e = engine(&store).for_owner(OwnerSpec::controller_of(&cluster_kind(), &cluster).unwrap());
    let err = e.ensure("v1/Secret", "dockercfg", Some("cluster-abc"), &dockercfg_producer()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Ownership { .. }), "{err}");
}

#[tokio::test]
async fn server_assigned_fields_do_not_cause_updates() {
    let store = Arc::new(MemoryStore::new());
    let e = engine(&store);
    // builds the service from scratch every time, never sets clusterIP
    let apiserver = || {
        Producer::typed(|mut svc: Service| {
            svc.spec = Some(ServiceSpec {
                ports: Some(vec![ServicePort { name: Some("https".into()), port: 443, ..Default::default() }]),
                type_: Some("NodePort".into()),
                ..Default::default()
            });
            Ok(svc)
        })
    };
    e.ensure("v1/Service", "apiserver-external", Some("cluster-abc"), &apiserver()).await.unwrap();
    let key = ResourceKind::of::<Service>().key(Some("cluster-abc"), "apiserver-external");
    store.edit(&key, |o| o.data["spec"]["clusterIP"] = json!("10.96.0.12")).unwrap();
    let writes = store.writes();

    let out = e.ensure("v1/Service", "apiserver-external", Some("cluster-abc"), &apiserver()).await.unwrap();
    assert_eq!(out.action, EnsureAction::Unchanged);
    assert_eq!(store.writes(), writes);
    assert_eq!(out.object.data["spec"]["clusterIP"], "10.96.0.12");
}

#[tokio::test]
async fn immutable_change_recreates() {
    let store = Arc::new(MemoryStore::new());
    let e = engine(&store);
    let etcd = |app: &'static str| {
        Producer::new(move |mut o: DynamicObject| {
            o.data["spec"] = json!({
                "serviceName": "etcd",
                "selector": { "matchLabels": { "app": app } },
                "template": { "metadata": { "labels": { "app": app } } }
            });
            Ok(o)
        })
    };
    let first = e.ensure("apps/v1/StatefulSet", "etcd", Some("cluster-abc"), &etcd("etcd")).await.unwrap();
    assert_eq!(first.action, EnsureAction::Created);

    let second = e.ensure("apps/v1/StatefulSet", "etcd", Some("cluster-abc"), &etcd("etcd-v2")).await.unwrap();
    assert_eq!(second.action, EnsureAction::Recreated);
    assert_ne!(second.object.metadata.uid, first.object.metadata.uid);
    assert_eq!(second.object.data["spec"]["selector"]["matchLabels"]["app"], "etcd-v2");

    let (sts, action) = e
        .ensure_typed::<StatefulSet, _>("etcd", Some("cluster-abc"), Ok)
        .await
        .unwrap();
    assert_eq!(action, EnsureAction::Unchanged);
    assert_eq!(sts.spec.unwrap().service_name, "etcd");
}

#[tokio::test]
async fn terminating_object_is_left_alone() {
    let store = Arc::new(MemoryStore::new());
    let key = secret_key("ns", "dockercfg");
    let mut held = empty_object(&key);
    held.metadata.finalizers = Some(vec!["example.com/hold".into()]);
    store.create(&secret_kind(), &held).await.unwrap();
    store.delete(&key).await.unwrap();
    let writes = store.writes();

    let out = engine(&store).ensure("v1/Secret", "dockercfg", Some("ns"), &dockercfg_producer()).await.unwrap();
    assert_eq!(out.action, EnsureAction::Terminating);
    assert_eq!(store.writes(), writes);
}

#[tokio::test]
async fn ensure_all_applies_modifiers_in_order() {
    let store = Arc::new(MemoryStore::new());
    let producers = vec![
        NamedProducer::new("dockercfg", dockercfg_producer()),
        NamedProducer::new("openvpn-ca", Producer::new(|mut o: DynamicObject| {
            o.data["data"] = json!({ "ca.crt": "Y2E=" });
            Ok(o)
        })),
    ];
    let common = labels(BTreeMap::from([("cluster".to_string(), "abc".to_string())]));
    let outs = engine(&store).ensure_all("v1/Secret", Some("cluster-abc"), &producers, &[common]).await.unwrap();
    assert_eq!(outs.len(), 2);
    for out in &outs {
        assert_eq!(out.action, EnsureAction::Created);
        assert_eq!(out.object.metadata.labels.as_ref().unwrap()["cluster"], "abc");
    }

    let broken = vec![
        NamedProducer::new("dockercfg", dockercfg_producer()),
        NamedProducer::new("bad", Producer::new(|_| Err(ProducerError::failed("no CA")))),
        NamedProducer::new("never", dockercfg_producer()),
    ];
    let err = engine(&store).ensure_all("v1/Secret", Some("cluster-abc"), &broken, &[]).await.unwrap_err();
    assert_eq!(err.key().map(|k| k.name.as_str()), Some("bad"));
    assert!(!store.contains(&secret_key("cluster-abc", "never")));
}
