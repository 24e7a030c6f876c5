//! Diff computation between desired and live resources
//!
//! Comparison is structural and three-way: every field present in the
//! desired manifest must match the live object, extra live fields are
//! ignored unless the controller applied them before (they appear in the
//! last-applied annotation) and they have since been removed from the
//! desired manifest. Server-populated fields and per-application ignore
//! rules are stripped before comparing.

use crate::manifest::{self, INSTANCE_LABEL, LAST_APPLIED_ANNOTATION};
use crate::resource::ManagedResource;
use crate::types::{DiffAction, DiffStatus, ResourceKey, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Metadata fields owned by the destination
const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "managedFields",
    "selfLink",
];

/// One field that differs between desired and live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDifference {
    /// JSON pointer of the field
    pub path: String,
    pub desired: Option<Value>,
    pub live: Option<Value>,
}

/// Result of comparing one resource
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiffOutcome {
    pub status: DiffStatus,
    pub action: DiffAction,
    pub differences: Vec<FieldDifference>,
    /// The live object was changed by someone other than this controller
    pub foreign: bool,
}

impl DiffOutcome {
    fn in_sync() -> Self {
        Self {
            status: DiffStatus::InSync,
            ..Self::default()
        }
    }

    fn out_of_sync(action: DiffAction) -> Self {
        Self {
            status: DiffStatus::OutOfSync,
            action,
            ..Self::default()
        }
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.status == DiffStatus::OutOfSync
    }

    /// Paths of the differing fields, for status reporting
    pub fn paths(&self) -> Vec<String> {
        self.differences.iter().map(|d| d.path.clone()).collect()
    }
}

/// Fields to leave out of comparison for matching resources
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IgnoreRule {
    /// API group; None matches any group
    #[serde(default)]
    pub group: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// JSON pointers, e.g. `/spec/replicas`
    #[serde(default)]
    pub json_pointers: Vec<String>,
}

impl IgnoreRule {
    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.kind == key.kind
            && self.group.as_ref().is_none_or(|g| *g == key.group)
            && self
                .namespace
                .as_ref()
                .is_none_or(|ns| key.namespace.as_ref() == Some(ns))
            && self.name.as_ref().is_none_or(|n| *n == key.name)
    }
}

/// Per-application comparison settings
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions<'a> {
    /// Application name, used to recognise owned live objects
    pub app: &'a str,
    pub ignore: &'a [IgnoreRule],
}

/// Strip server-populated fields, controller bookkeeping and ignored paths
pub fn normalize(manifest: &Value, key: &ResourceKey, ignore: &[IgnoreRule]) -> Value {
    let mut value = manifest.clone();
    if let Some(object) = value.as_object_mut() {
        object.remove("status");
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_METADATA {
                metadata.remove(*field);
            }
            prune_empty_entry(metadata, "annotations", LAST_APPLIED_ANNOTATION);
            prune_empty_entry(metadata, "labels", INSTANCE_LABEL);
        }
    }
    for rule in ignore.iter().filter(|r| r.matches(key)) {
        for pointer in &rule.json_pointers {
            remove_pointer(&mut value, pointer);
        }
    }
    value
}

/// Remove `entry` from a metadata sub-map, dropping the map if it ends up empty
fn prune_empty_entry(metadata: &mut serde_json::Map<String, Value>, map: &str, entry: &str) {
    let now_empty = match metadata.get_mut(map).and_then(Value::as_object_mut) {
        Some(inner) => {
            inner.remove(entry);
            inner.is_empty()
        }
        None => false,
    };
    if now_empty {
        metadata.remove(map);
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Remove the value at a JSON pointer, if present
pub fn remove_pointer(value: &mut Value, pointer: &str) -> Option<Value> {
    let (parent, last) = pointer.rsplit_once('/')?;
    let last = unescape(last);
    let target = if parent.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(parent)
    }?;
    match target {
        Value::Object(map) => map.remove(&last),
        Value::Array(items) => {
            let index: usize = last.parse().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn compare_values(
    path: &str,
    desired: &Value,
    live: &Value,
    applied: Option<&Value>,
    out: &mut Vec<FieldDifference>,
) {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => {
            for (field, dv) in d {
                let child = format!("{path}/{}", escape(field));
                match l.get(field) {
                    Some(lv) => {
                        compare_values(&child, dv, lv, applied.and_then(|a| a.get(field)), out);
                    }
                    None => out.push(FieldDifference {
                        path: child,
                        desired: Some(dv.clone()),
                        live: None,
                    }),
                }
            }
            // Fields we applied earlier but no longer want
            if let Some(Value::Object(a)) = applied {
                for (field, lv) in l {
                    if !d.contains_key(field) && a.contains_key(field) {
                        out.push(FieldDifference {
                            path: format!("{path}/{}", escape(field)),
                            desired: None,
                            live: Some(lv.clone()),
                        });
                    }
                }
            }
        }
        (Value::Array(d), Value::Array(l)) if d.len() == l.len() => {
            for (index, (dv, lv)) in d.iter().zip(l).enumerate() {
                let nested = applied.and_then(|a| a.get(index));
                compare_values(&format!("{path}/{index}"), dv, lv, nested, out);
            }
        }
        _ => {
            if desired != live {
                out.push(FieldDifference {
                    path: if path.is_empty() { "/".to_string() } else { path.to_string() },
                    desired: Some(desired.clone()),
                    live: Some(live.clone()),
                });
            }
        }
    }
}

/// Compare one matched desired/live pair
pub fn compare_resource(
    key: &ResourceKey,
    desired: &Value,
    live: &Value,
    ignore: &[IgnoreRule],
) -> DiffOutcome {
    let desired_norm = normalize(desired, key, ignore);
    let live_norm = normalize(live, key, ignore);
    let applied = manifest::last_applied(live).map(|a| normalize(&a, key, ignore));

    let mut differences = Vec::new();
    compare_values("", &desired_norm, &live_norm, applied.as_ref(), &mut differences);

    if differences.is_empty() {
        return DiffOutcome::in_sync();
    }

    // Desired is unchanged since our last apply, so the drift came from elsewhere.
    let foreign = applied.as_ref().is_none_or(|a| *a == desired_norm);

    DiffOutcome {
        status: DiffStatus::OutOfSync,
        action: DiffAction::Update,
        differences,
        foreign,
    }
}

/// Diff desired resources against live resources
///
/// Desired-only entries become Create, live-only entries owned by the
/// application become Prune candidates, matched entries are Update or
/// InSync. Live objects owned by someone else are left out entirely.
/// The result is ordered by wave, then key.
pub fn diff(
    desired: Vec<ManagedResource>,
    live: Vec<ManagedResource>,
    opts: DiffOptions<'_>,
) -> Vec<ManagedResource> {
    let mut live_by_key: BTreeMap<ResourceKey, ManagedResource> =
        live.into_iter().map(|r| (r.key.clone(), r)).collect();

    let mut results = Vec::with_capacity(desired.len());
    for mut resource in desired {
        resource.live = live_by_key.remove(&resource.key).and_then(|l| l.live);
        resource.diff = match (&resource.desired, &resource.live) {
            (Some(d), Some(l)) => compare_resource(&resource.key, d, l, opts.ignore),
            (Some(_), None) => DiffOutcome::out_of_sync(DiffAction::Create),
            _ => DiffOutcome::default(),
        };
        results.push(resource);
    }

    for (_, mut extra) in live_by_key {
        let Some(live) = &extra.live else { continue };
        let owned = manifest::instance(live) == Some(opts.app);
        if !owned || extra.is_hook() || manifest::ignore_extraneous(live) {
            continue;
        }
        extra.diff = DiffOutcome::out_of_sync(DiffAction::Prune);
        results.push(extra);
    }

    results.sort_by(|a, b| a.wave.cmp(&b.wave).then_with(|| a.key.cmp(&b.key)));
    results
}

/// Mark every comparison as Unknown, keeping the planned actions
///
/// Used when the live cache cannot vouch for its data.
pub fn mark_unknown(resources: &mut [ManagedResource]) {
    for resource in resources {
        resource.diff.status = DiffStatus::Unknown;
    }
}

/// Roll resource comparisons up into an application sync status
pub fn sync_status(resources: &[ManagedResource]) -> SyncStatus {
    let mut status = SyncStatus::Synced;
    for resource in resources.iter().filter(|r| r.counts_toward_status()) {
        match resource.diff.status {
            DiffStatus::Unknown => return SyncStatus::Unknown,
            DiffStatus::OutOfSync => status = SyncStatus::OutOfSync,
            DiffStatus::InSync => {}
        }
    }
    status
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub creates: usize,
    pub updates: usize,
    pub prunes: usize,
    pub in_sync: usize,
    /// Out-of-sync resources changed by another actor
    pub foreign: usize,
}

impl DiffSummary {
    pub fn from_resources(resources: &[ManagedResource]) -> Self {
        let mut summary = Self::default();
        for resource in resources.iter().filter(|r| r.counts_toward_status()) {
            match resource.diff.action {
                DiffAction::Create => summary.creates += 1,
                DiffAction::Update => summary.updates += 1,
                DiffAction::Prune => summary.prunes += 1,
                DiffAction::None => summary.in_sync += 1,
            }
            if resource.diff.foreign {
                summary.foreign += 1;
            }
        }
        summary
    }

    pub fn total_changes(&self) -> usize {
        self.creates + self.updates + self.prunes
    }

    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }
}
