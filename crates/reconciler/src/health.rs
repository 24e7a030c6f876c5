//! Health evaluation for managed resources and applications

use crate::registry::ResourceRegistry;
use crate::resource::ManagedResource;
use crate::types::{GroupKind, HealthAssessment, HealthStatus};
use serde_json::Value;

/// Assess a single live object with its kind's rule
pub fn assess_live(registry: &ResourceRegistry, kind: &GroupKind, live: &Value) -> HealthAssessment {
    (registry.describe(kind).health)(live)
}

/// Assess a live object, also checking the objects it owns among `neighbours`
///
/// A failing child only overrides an owner that looks Healthy or
/// Progressing; the owner's own Degraded or Suspended verdict stands.
pub fn assess_live_with(
    registry: &ResourceRegistry,
    kind: &GroupKind,
    live: &Value,
    neighbours: &[&Value],
) -> HealthAssessment {
    let descriptor = registry.describe(kind);
    let own = (descriptor.health)(live);
    if !matches!(own.status, HealthStatus::Healthy | HealthStatus::Progressing) {
        return own;
    }
    descriptor
        .children
        .and_then(|rule| rule(live, neighbours))
        .unwrap_or(own)
}

/// Assess one managed resource
///
/// A desired resource that is not live yet is Missing; anything else
/// without a live object has no meaningful health.
pub fn assess(
    registry: &ResourceRegistry,
    resource: &ManagedResource,
    neighbours: &[&Value],
) -> HealthAssessment {
    match (&resource.live, &resource.desired) {
        (Some(live), _) => assess_live_with(registry, &resource.key.group_kind(), live, neighbours),
        (None, Some(_)) => HealthAssessment::new(HealthStatus::Missing),
        (None, None) => HealthAssessment::new(HealthStatus::Unknown),
    }
}

/// Fill in `health` for every resource
pub fn assess_all(registry: &ResourceRegistry, resources: &mut [ManagedResource], neighbours: &[&Value]) {
    for resource in resources {
        resource.health = Some(assess(registry, resource, neighbours));
    }
}

/// Application health: the worst health among its desired, non-hook resources
///
/// Prune candidates and hooks do not contribute. An application with no
/// resources is Healthy.
pub fn aggregate(resources: &[ManagedResource]) -> HealthStatus {
    resources
        .iter()
        .filter(|r| r.counts_toward_status() && r.desired.is_some())
        .map(|r| r.health.as_ref().map_or(HealthStatus::Unknown, |h| h.status))
        .fold(HealthStatus::Healthy, HealthStatus::worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HookRole, ResourceKey};
    use serde_json::json;

    fn deployment(ready: i64) -> ManagedResource {
        let manifest = json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web", "namespace": "default"}, "spec": {"replicas": 3}});
        let mut resource = ManagedResource::from_desired(
            ResourceKey::new("apps", "Deployment", Some("default"), "web"),
            manifest.clone(),
            1,
            None,
        );
        let mut live = manifest;
        live["metadata"]["generation"] = json!(1);
        live["status"] = json!({"observedGeneration": 1, "replicas": 3, "updatedReplicas": 3, "readyReplicas": ready, "availableReplicas": ready});
        resource.live = Some(live);
        resource
    }

    #[test]
    fn test_missing_when_not_live() {
        let registry = ResourceRegistry::builtin();
        let mut resource = deployment(3);
        resource.live = None;
        assert_eq!(assess(&registry, &resource, &[]).status, HealthStatus::Missing);
    }

    #[test]
    fn test_worst_wins() {
        let registry = ResourceRegistry::builtin();
        let mut resources = vec![deployment(3), deployment(1)];
        assess_all(&registry, &mut resources, &[]);
        assert_eq!(resources[0].health.as_ref().unwrap().status, HealthStatus::Healthy);
        assert_eq!(aggregate(&resources), HealthStatus::Progressing);
    }

    #[test]
    fn test_hooks_and_prunes_excluded() {
        let registry = ResourceRegistry::builtin();
        let mut hook = deployment(0);
        hook.hook = Some(HookRole::PreSync);
        let mut prune = deployment(0);
        prune.desired = None;

        let mut resources = vec![deployment(3), hook, prune];
        assess_all(&registry, &mut resources, &[]);
        assert_eq!(aggregate(&resources), HealthStatus::Healthy);
    }

    fn crash_looping_pod(namespace: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web-7d4b9-x2x9q", "namespace": namespace, "labels": {"app": "web"}},
            "status": {
                "phase": "Running",
                "containerStatuses": [{"name": "web", "state": {"waiting": {"reason": "CrashLoopBackOff"}}}]
            }
        })
    }

    #[test]
    fn test_crash_looping_pods_degrade_workload() {
        let registry = ResourceRegistry::builtin();
        let mut resource = deployment(3);
        if let Some(live) = resource.live.as_mut() {
            live["spec"]["selector"] = json!({"matchLabels": {"app": "web"}});
        }

        let elsewhere = crash_looping_pod("staging");
        let assessment = assess(&registry, &resource, &[&elsewhere]);
        assert_eq!(assessment.status, HealthStatus::Healthy);

        let pod = crash_looping_pod("default");
        let assessment = assess(&registry, &resource, &[&elsewhere, &pod]);
        assert_eq!(assessment.status, HealthStatus::Degraded);
        assert_eq!(
            assessment.message.as_deref(),
            Some("pod web-7d4b9-x2x9q: web: CrashLoopBackOff")
        );
    }

    #[test]
    fn test_own_degraded_verdict_wins() {
        let registry = ResourceRegistry::builtin();
        let mut resource = deployment(3);
        if let Some(live) = resource.live.as_mut() {
            live["spec"]["selector"] = json!({"matchLabels": {"app": "web"}});
            live["status"]["conditions"] = json!([{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded", "message": "rollout stalled"}]);
        }
        let own = assess(&registry, &resource, &[]);
        assert_eq!(own.status, HealthStatus::Degraded);

        let pod = crash_looping_pod("default");
        assert_eq!(assess(&registry, &resource, &[&pod]), own);
    }

    #[test]
    fn test_empty_is_healthy() {
        assert_eq!(aggregate(&[]), HealthStatus::Healthy);
    }
}
