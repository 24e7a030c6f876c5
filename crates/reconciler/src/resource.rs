//! Managed resources - one desired/live pair under an application's control
//!
//! A [`ManagedResource`] is never stored on its own: it is recomputed on
//! every reconciliation pass from the rendered manifest set and the live
//! cache.

use crate::diff::DiffOutcome;
use crate::error::RenderError;
use crate::manifest::{self, ManifestSet};
use crate::registry::ResourceRegistry;
use crate::types::{HealthAssessment, HookRole, ResourceKey};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub struct ManagedResource {
    pub key: ResourceKey,
    /// None when the resource should be pruned
    pub desired: Option<Value>,
    /// None when the resource has not been observed
    pub live: Option<Value>,
    pub diff: DiffOutcome,
    pub health: Option<HealthAssessment>,
    pub wave: i32,
    pub hook: Option<HookRole>,
}

impl ManagedResource {
    /// A resource known only from its rendered manifest
    pub fn from_desired(key: ResourceKey, desired: Value, wave: i32, hook: Option<HookRole>) -> Self {
        Self {
            key,
            desired: Some(desired),
            live: None,
            diff: DiffOutcome::default(),
            health: None,
            wave,
            hook,
        }
    }

    /// A resource known only from the destination
    ///
    /// Wave and hook role are read back from the annotations we applied;
    /// malformed annotations fall back to the kind defaults.
    pub fn from_live(live: Value, registry: &ResourceRegistry) -> Option<Self> {
        let key = manifest::live_key(&live)?;
        let wave = manifest::explicit_wave(&live, &key)
            .ok()
            .flatten()
            .unwrap_or_else(|| registry.describe(&key.group_kind()).default_wave);
        let hook = manifest::hook_role(&live, &key).ok().flatten();
        Some(Self {
            key,
            desired: None,
            live: Some(live),
            diff: DiffOutcome::default(),
            health: None,
            wave,
            hook,
        })
    }

    pub fn is_hook(&self) -> bool {
        self.hook.is_some()
    }

    /// Whether the resource takes part in the application's steady state
    pub fn counts_toward_status(&self) -> bool {
        !self.is_hook()
    }
}

/// Turn a rendered manifest set into desired resources
///
/// Namespaced kinds without a namespace inherit `default_namespace`.
/// Any malformed manifest fails the whole set: a partially understood
/// desired state is never acted on.
pub fn desired_resources(
    set: &ManifestSet,
    default_namespace: Option<&str>,
    registry: &ResourceRegistry,
) -> Result<Vec<ManagedResource>, RenderError> {
    let mut seen = HashSet::new();
    let mut resources = Vec::with_capacity(set.manifests.len());

    for (index, raw) in set.manifests.iter().enumerate() {
        if !raw.is_object() {
            return Err(RenderError::Parse {
                origin: format!("manifest #{index}"),
                message: "expected a mapping".to_string(),
            });
        }

        let mut desired = raw.clone();
        let key = manifest::resource_key(&desired, index)?;
        let descriptor = registry.describe(&key.group_kind());

        let key = match (&key.namespace, descriptor.namespaced, default_namespace) {
            (None, true, Some(ns)) => {
                manifest::set_namespace(&mut desired, ns);
                manifest::resource_key(&desired, index)?
            }
            _ => key,
        };

        if !seen.insert(key.clone()) {
            return Err(RenderError::Duplicate {
                key: key.to_string(),
            });
        }

        let wave = manifest::explicit_wave(&desired, &key)?.unwrap_or(descriptor.default_wave);
        let hook = manifest::hook_role(&desired, &key)?;
        resources.push(ManagedResource::from_desired(key, desired, wave, hook));
    }

    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(manifests: Vec<Value>) -> ManifestSet {
        ManifestSet::new("r1", manifests)
    }

    #[test]
    fn test_default_namespace_and_wave() {
        let registry = ResourceRegistry::builtin();
        let resources = desired_resources(
            &set(vec![
                json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "web"}}),
                json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "frontend"}}),
            ]),
            Some("web"),
            &registry,
        )
        .unwrap();

        assert_eq!(resources[0].key.namespace, None);
        assert_eq!(resources[0].wave, 0);
        assert_eq!(resources[1].key.namespace.as_deref(), Some("web"));
        assert_eq!(resources[1].wave, 1);
        assert_eq!(
            resources[1].desired.as_ref().and_then(manifest::namespace),
            Some("web")
        );
    }

    #[test]
    fn test_explicit_wave_wins() {
        let registry = ResourceRegistry::builtin();
        let resources = desired_resources(
            &set(vec![json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "db-migrate", "annotations": {"syncwave.dev/sync-wave": "-3"}}
            })]),
            Some("web"),
            &registry,
        )
        .unwrap();
        assert_eq!(resources[0].wave, -3);
    }

    #[test]
    fn test_hook_detected() {
        let registry = ResourceRegistry::builtin();
        let resources = desired_resources(
            &set(vec![json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": {"name": "migrate", "annotations": {"syncwave.dev/hook": "PreSync"}}
            })]),
            Some("web"),
            &registry,
        )
        .unwrap();
        assert_eq!(resources[0].hook, Some(HookRole::PreSync));
        assert!(!resources[0].counts_toward_status());
    }

    #[test]
    fn test_duplicates_rejected() {
        let registry = ResourceRegistry::builtin();
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}});
        let err = desired_resources(&set(vec![cm.clone(), cm]), Some("web"), &registry)
            .unwrap_err();
        assert!(matches!(err, RenderError::Duplicate { .. }));
    }

    #[test]
    fn test_non_object_rejected() {
        let registry = ResourceRegistry::builtin();
        let err = desired_resources(&set(vec![json!("oops")]), None, &registry).unwrap_err();
        assert!(matches!(err, RenderError::Parse { .. }));
    }
}
