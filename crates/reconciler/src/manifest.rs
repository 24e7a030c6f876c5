//! Helpers for reading and annotating rendered manifests
//!
//! Manifests are kept as `serde_json::Value` so unknown kinds pass through
//! untouched; only identity, labels and annotations are interpreted here.

use crate::error::RenderError;
use crate::types::{HookRole, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Explicit sync wave of a resource
pub const WAVE_ANNOTATION: &str = "syncwave.dev/sync-wave";
/// Marks a manifest as a hook bound to a sync phase
pub const HOOK_ANNOTATION: &str = "syncwave.dev/hook";
/// Desired manifest as it was last applied by the controller
pub const LAST_APPLIED_ANNOTATION: &str = "syncwave.dev/last-applied";
/// Comparison options, e.g. `IgnoreExtraneous`
pub const COMPARE_OPTIONS_ANNOTATION: &str = "syncwave.dev/compare-options";
/// Sync options, e.g. `Prune=false`
pub const SYNC_OPTIONS_ANNOTATION: &str = "syncwave.dev/sync-options";
/// Ownership label set on everything the controller applies
pub const INSTANCE_LABEL: &str = "syncwave.dev/instance";

/// A rendered manifest set for one revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSet {
    pub revision: String,
    /// blake3 digest over the canonical JSON of every manifest
    pub digest: String,
    pub manifests: Vec<Value>,
}

impl ManifestSet {
    pub fn new(revision: impl Into<String>, manifests: Vec<Value>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for manifest in &manifests {
            // serde_json maps are ordered, so this is stable for equal input
            hasher.update(manifest.to_string().as_bytes());
            hasher.update(b"\n");
        }
        Self {
            revision: revision.into(),
            digest: hasher.finalize().to_hex().to_string(),
            manifests,
        }
    }
}

/// Split `apiVersion` into its group (empty for the core group)
pub fn api_group(manifest: &Value) -> &str {
    let api_version = manifest
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match api_version.split_once('/') {
        Some((group, _version)) => group,
        None => "",
    }
}

pub fn kind(manifest: &Value) -> Option<&str> {
    manifest.get("kind").and_then(Value::as_str)
}

pub fn name(manifest: &Value) -> Option<&str> {
    manifest.pointer("/metadata/name").and_then(Value::as_str)
}

pub fn namespace(manifest: &Value) -> Option<&str> {
    manifest
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty())
}

/// Resolve the identity of a manifest at position `index` of its set
pub fn resource_key(manifest: &Value, index: usize) -> Result<ResourceKey, RenderError> {
    let kind = kind(manifest).ok_or(RenderError::MissingField {
        index,
        field: "kind",
    })?;
    let name = name(manifest).ok_or(RenderError::MissingField {
        index,
        field: "metadata.name",
    })?;
    Ok(ResourceKey::new(
        api_group(manifest),
        kind,
        namespace(manifest),
        name,
    ))
}

/// Identity of a live object; objects we cannot identify are skipped
pub fn live_key(manifest: &Value) -> Option<ResourceKey> {
    resource_key(manifest, 0).ok()
}

pub fn annotation<'a>(manifest: &'a Value, name: &str) -> Option<&'a str> {
    manifest
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(name))
        .and_then(Value::as_str)
}

pub fn label<'a>(manifest: &'a Value, name: &str) -> Option<&'a str> {
    manifest
        .pointer("/metadata/labels")
        .and_then(|l| l.get(name))
        .and_then(Value::as_str)
}

/// Application that owns a live object, if any
pub fn instance(manifest: &Value) -> Option<&str> {
    label(manifest, INSTANCE_LABEL)
}

/// Explicit wave annotation, if set
pub fn explicit_wave(manifest: &Value, key: &ResourceKey) -> Result<Option<i32>, RenderError> {
    match annotation(manifest, WAVE_ANNOTATION) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| RenderError::InvalidAnnotation {
                key: key.to_string(),
                annotation: WAVE_ANNOTATION,
                value: raw.to_string(),
            }),
    }
}

/// Hook role annotation, if set
pub fn hook_role(manifest: &Value, key: &ResourceKey) -> Result<Option<HookRole>, RenderError> {
    match annotation(manifest, HOOK_ANNOTATION) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<HookRole>()
            .map(Some)
            .map_err(|_| RenderError::InvalidAnnotation {
                key: key.to_string(),
                annotation: HOOK_ANNOTATION,
                value: raw.to_string(),
            }),
    }
}

/// Check a comma-separated option list annotation, e.g. `Prune=false,Replace=true`
pub fn has_option(manifest: &Value, annotation_name: &str, option: &str) -> bool {
    annotation(manifest, annotation_name)
        .map(|raw| raw.split(',').any(|o| o.trim() == option))
        .unwrap_or(false)
}

/// Whether the controller must never delete this object
pub fn prune_disabled(manifest: &Value) -> bool {
    has_option(manifest, SYNC_OPTIONS_ANNOTATION, "Prune=false")
}

/// Whether an extraneous live object should be left out of comparison
pub fn ignore_extraneous(manifest: &Value) -> bool {
    has_option(manifest, COMPARE_OPTIONS_ANNOTATION, "IgnoreExtraneous")
}

/// The manifest recorded at the controller's last apply, if parseable
pub fn last_applied(live: &Value) -> Option<Value> {
    annotation(live, LAST_APPLIED_ANNOTATION).and_then(|raw| serde_json::from_str(raw).ok())
}

fn metadata_map<'a>(manifest: &'a mut Value, field: &str) -> Option<&'a mut Map<String, Value>> {
    let object = manifest.as_object_mut()?;
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()?;
    metadata
        .entry(field)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

pub fn set_label(manifest: &mut Value, name: &str, value: &str) {
    if let Some(labels) = metadata_map(manifest, "labels") {
        labels.insert(name.to_string(), Value::String(value.to_string()));
    }
}

pub fn set_annotation(manifest: &mut Value, name: &str, value: &str) {
    if let Some(annotations) = metadata_map(manifest, "annotations") {
        annotations.insert(name.to_string(), Value::String(value.to_string()));
    }
}

pub fn set_namespace(manifest: &mut Value, namespace: &str) {
    if let Some(metadata) = manifest
        .as_object_mut()
        .map(|o| o.entry("metadata").or_insert_with(|| Value::Object(Map::new())))
        .and_then(Value::as_object_mut)
    {
        metadata.insert(
            "namespace".to_string(),
            Value::String(namespace.to_string()),
        );
    }
}

/// Stamp ownership and last-applied state onto a desired manifest before apply
pub fn prepare_for_apply(desired: &Value, app: &str) -> Value {
    let mut manifest = desired.clone();
    set_annotation(&mut manifest, LAST_APPLIED_ANNOTATION, &desired.to_string());
    set_label(&mut manifest, INSTANCE_LABEL, app);
    manifest
}
