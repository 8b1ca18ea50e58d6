//! `status.conditions` entries on dynamic objects.

use chrono::{SecondsFormat, Utc};
use kube::core::DynamicObject;
use serde_json::{json, Value as Json};

pub const CLEANUP_BLOCKED: &str = "CleanupBlocked";
/// A step is still waiting on external state; the message names its marker.
pub const CLEANUP_PENDING: &str = "CleanupPending";

/// Status (`"True"`/`"False"`) of condition `type_`, if set.
pub fn condition_status<'a>(obj: &'a DynamicObject, type_: &str) -> Option<&'a str> {
    conditions(obj)?.iter().find(|c| c["type"] == type_).and_then(|c| c["status"].as_str())
}

fn conditions(obj: &DynamicObject) -> Option<&Vec<Json>> {
    obj.data.get("status")?.get("conditions")?.as_array()
}

/// Upsert a condition. `lastTransitionTime` moves only when the status flips.
/// Returns false when nothing changed.
pub fn set_condition(obj: &mut DynamicObject, type_: &str, status: bool, reason: &str, message: &str) -> bool {
    let status = if status { "True" } else { "False" };
    if !obj.data.is_object() {
        obj.data = json!({});
    }
    let root = &mut obj.data;
    if !root.get("status").is_some_and(Json::is_object) {
        root["status"] = json!({});
    }
    if !root["status"].get("conditions").is_some_and(Json::is_array) {
        root["status"]["conditions"] = json!([]);
    }
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let Some(list) = root["status"]["conditions"].as_array_mut() else { return false };
    match list.iter_mut().find(|c| c["type"] == type_) {
        Some(c) => {
            if c["status"] == status && c["reason"] == reason && c["message"] == message {
                return false;
            }
            if c["status"] != status {
                c["lastTransitionTime"] = json!(now);
            }
            c["status"] = json!(status);
            c["reason"] = json!(reason);
            c["message"] = json!(message);
        }
        None => list.push(json!({
            "type": type_,
            "status": status,
            "reason": reason,
            "message": message,
            "lastTransitionTime": now,
        })),
    }
    true
}
