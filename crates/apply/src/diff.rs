use keel_core::pointer_get;
use keel_core::pointer_set;
use serde::Serialize;
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// Count leaf adds/updates/removes going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                s.updates += (0..min_len).filter(|&i| aa[i] != bb[i]).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Fill `desired` with what the producer does not own: `status` always, and
/// each path in `paths` that desired leaves out but current has.
pub fn carry_over(desired: &mut Json, current: &Json, paths: &[String]) {
    match current.get("status") {
        Some(status) if !status.is_null() => {
            pointer_set(desired, "/status", status.clone());
        }
        _ => {
            if let Some(obj) = desired.as_object_mut() {
                obj.remove("status");
            }
        }
    }
    for path in paths {
        if pointer_get(desired, path).is_some() {
            continue;
        }
        if let Some(v) = pointer_get(current, path) {
            pointer_set(desired, path, v.clone());
        }
    }
}

/// Immutable paths whose desired value differs from current.
pub fn immutable_changed(current: &Json, desired: &Json, paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter(|p| pointer_get(current, p) != pointer_get(desired, p))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3], "e": "gone" });
        let target = json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 2 });
        assert!(diff_summary(&base, &base).is_empty());
    }

    #[test]
    fn server_fields_and_status_are_carried() {
        let current = json!({
            "spec": { "clusterIP": "10.0.0.7", "ports": [{ "port": 443 }] },
            "status": { "loadBalancer": {} }
        });
        let mut desired = json!({ "spec": { "ports": [{ "port": 443 }] } });
        carry_over(&mut desired, &current, &["/spec/clusterIP".to_string(), "/spec/healthCheckNodePort".to_string()]);
        assert_eq!(desired["spec"]["clusterIP"], "10.0.0.7");
        assert!(desired["spec"].get("healthCheckNodePort").is_none());
        assert_eq!(desired["status"], json!({ "loadBalancer": {} }));
    }

    #[test]
    fn producer_value_wins_over_server_value() {
        let current = json!({ "spec": { "clusterIP": "10.0.0.7" } });
        let mut desired = json!({ "spec": { "clusterIP": "None" }, "status": { "stale": true } });
        carry_over(&mut desired, &current, &["/spec/clusterIP".to_string()]);
        assert_eq!(desired["spec"]["clusterIP"], "None");
        assert!(desired.get("status").is_none());
    }

    #[test]
    fn immutable_changes_are_reported_by_path() {
        let paths = vec!["/spec/selector".to_string(), "/spec/serviceName".to_string()];
        let current = json!({ "spec": { "selector": { "matchLabels": { "app": "etcd" } }, "serviceName": "etcd" } });
        let same = current.clone();
        assert!(immutable_changed(&current, &same, &paths).is_empty());
        let desired = json!({ "spec": { "selector": { "matchLabels": { "app": "etcd-v2" } }, "serviceName": "etcd" } });
        assert_eq!(immutable_changed(&current, &desired, &paths), vec!["/spec/selector".to_string()]);
    }
}
