//! Destination adapters: the only egress point for mutation
//!
//! A destination stores resources keyed by [`ResourceKey`]. Adapters
//! behave like an API server: `apply` fills in server-owned metadata and
//! keeps the existing status, `watch` streams change events when the
//! transport supports it.

mod directory;
mod memory;

pub use directory::DirectoryDestination;
pub use memory::{CallKind, FailureMode, MemoryDestination, RecordedCall};

use crate::error::ApplyError;
use crate::manifest;
use crate::types::ResourceKey;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// A change observed on a destination
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Object created or updated, with its new content
    Applied(Value),
    /// Object removed, with its last known content
    Deleted(Value),
}

impl WatchEvent {
    pub fn object(&self) -> &Value {
        match self {
            Self::Applied(v) | Self::Deleted(v) => v,
        }
    }
}

/// Target system adapter
#[async_trait]
pub trait Destination: Send + Sync {
    /// Destination name as referenced by applications
    fn name(&self) -> &str;

    /// Fetch one object, `None` if it does not exist
    async fn get(&self, key: &ResourceKey) -> Result<Option<Value>, ApplyError>;

    /// List every object on the destination
    async fn list(&self) -> Result<Vec<Value>, ApplyError>;

    /// Subscribe to changes
    ///
    /// The channel closes when the watch is broken; callers relist.
    /// Adapters without streaming return [`ApplyError::WatchUnsupported`].
    async fn watch(&self) -> Result<mpsc::Receiver<WatchEvent>, ApplyError>;

    /// Create or update an object, returning the stored result
    async fn apply(&self, manifest: &Value) -> Result<Value, ApplyError>;

    /// Delete an object
    async fn delete(&self, key: &ResourceKey) -> Result<(), ApplyError>;
}

fn spec_of(value: &Value) -> Value {
    let mut stripped = value.clone();
    if let Some(object) = stripped.as_object_mut() {
        object.remove("status");
        object.remove("metadata");
    }
    stripped
}

/// Server-side admission shared by the built-in adapters
///
/// Assigns uid, resourceVersion, generation and creationTimestamp. The
/// generation only moves when something other than metadata or status
/// changed. Status is owned by the destination and survives updates.
pub(crate) fn admit(existing: Option<&Value>, incoming: &Value, revision: u64) -> Value {
    let mut stored = incoming.clone();
    let Some(object) = stored.as_object_mut() else {
        return stored;
    };
    object.remove("status");

    let (uid, created, generation) = match existing {
        Some(old) => {
            let generation = old
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let bumped = if spec_of(old) == spec_of(incoming) {
                generation
            } else {
                generation + 1
            };
            (
                old.pointer("/metadata/uid").cloned().unwrap_or(Value::Null),
                old.pointer("/metadata/creationTimestamp")
                    .cloned()
                    .unwrap_or(Value::Null),
                bumped,
            )
        }
        None => (
            json!(format!("{:016x}", revision)),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            1,
        ),
    };

    if let Some(metadata) = object
        .entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
    {
        metadata.insert("uid".to_string(), uid);
        metadata.insert("resourceVersion".to_string(), json!(revision.to_string()));
        metadata.insert("generation".to_string(), json!(generation));
        metadata.insert("creationTimestamp".to_string(), created);
    }
    if let Some(status) = existing.and_then(|old| old.get("status")) {
        object.insert("status".to_string(), status.clone());
    }
    stored
}

fn replicas(value: &Value) -> i64 {
    value
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1)
}

/// Simulate workload controllers converging an object to ready
///
/// Used by destinations configured to settle; kinds without a notion of
/// readiness are left alone.
pub fn settle_status(object: &mut Value) {
    let generation = object
        .pointer("/metadata/generation")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let status = match (manifest::api_group(object), manifest::kind(object)) {
        ("apps", Some("Deployment" | "ReplicaSet")) => {
            let n = replicas(object);
            json!({"observedGeneration": generation, "replicas": n, "readyReplicas": n,
                   "updatedReplicas": n, "availableReplicas": n})
        }
        ("apps", Some("StatefulSet")) => {
            let n = replicas(object);
            json!({"observedGeneration": generation, "replicas": n, "readyReplicas": n,
                   "updatedReplicas": n, "currentRevision": format!("rev-{generation}"),
                   "updateRevision": format!("rev-{generation}")})
        }
        ("apps", Some("DaemonSet")) => json!({"observedGeneration": generation,
            "desiredNumberScheduled": 1, "numberReady": 1, "updatedNumberScheduled": 1,
            "numberAvailable": 1}),
        ("batch", Some("Job")) => {
            let completions = object
                .pointer("/spec/completions")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            json!({"succeeded": completions,
                   "conditions": [{"type": "Complete", "status": "True"}]})
        }
        ("", Some("Pod")) => json!({"phase": "Running",
            "conditions": [{"type": "Ready", "status": "True"}]}),
        ("", Some("PersistentVolumeClaim")) => json!({"phase": "Bound"}),
        ("", Some("Service"))
            if object.pointer("/spec/type").and_then(Value::as_str) == Some("LoadBalancer") =>
        {
            json!({"loadBalancer": {"ingress": [{"ip": "127.0.0.1"}]}})
        }
        ("networking.k8s.io", Some("Ingress")) => {
            json!({"loadBalancer": {"ingress": [{"ip": "127.0.0.1"}]}})
        }
        _ => return,
    };
    if let Some(map) = object.as_object_mut() {
        map.insert("status".to_string(), status);
    }
}
