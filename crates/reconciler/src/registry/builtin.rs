//! Built-in kind table and health rules

use super::{KindDescriptor, KindTier};
use crate::types::{GroupKind, HealthAssessment, HealthStatus};
use serde_json::{Map, Value};

const APPS: &str = "apps";
const BATCH: &str = "batch";
const RBAC: &str = "rbac.authorization.k8s.io";
const NETWORKING: &str = "networking.k8s.io";

/// Container waiting reasons that never resolve without intervention
const CRASH_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

pub(super) fn descriptors() -> Vec<(GroupKind, KindDescriptor)> {
    use KindTier::{Config, Foundation, Network, Workload};

    vec![
        // Foundation
        (
            GroupKind::core("Namespace"),
            KindDescriptor::new(Foundation).cluster_scoped(),
        ),
        (
            GroupKind::new("apiextensions.k8s.io", "CustomResourceDefinition"),
            KindDescriptor::new(Foundation).cluster_scoped(),
        ),
        // Config
        (GroupKind::core("ServiceAccount"), KindDescriptor::new(Config)),
        (GroupKind::core("ConfigMap"), KindDescriptor::new(Config)),
        (GroupKind::core("Secret"), KindDescriptor::new(Config)),
        (GroupKind::core("LimitRange"), KindDescriptor::new(Config)),
        (GroupKind::core("ResourceQuota"), KindDescriptor::new(Config)),
        (GroupKind::new(RBAC, "Role"), KindDescriptor::new(Config)),
        (GroupKind::new(RBAC, "RoleBinding"), KindDescriptor::new(Config)),
        (
            GroupKind::new(RBAC, "ClusterRole"),
            KindDescriptor::new(Config).cluster_scoped(),
        ),
        (
            GroupKind::new(RBAC, "ClusterRoleBinding"),
            KindDescriptor::new(Config).cluster_scoped(),
        ),
        (
            GroupKind::new("storage.k8s.io", "StorageClass"),
            KindDescriptor::new(Config).cluster_scoped(),
        ),
        (
            GroupKind::core("PersistentVolume"),
            KindDescriptor::new(Config).cluster_scoped(),
        ),
        (
            GroupKind::core("PersistentVolumeClaim"),
            KindDescriptor::new(Config).health(pvc_health),
        ),
        // Workloads
        (
            GroupKind::new(APPS, "Deployment"),
            KindDescriptor::new(Workload)
                .health(deployment_health)
                .children(crashing_pods)
                .wave(1)
                .gated(),
        ),
        (
            GroupKind::new(APPS, "StatefulSet"),
            KindDescriptor::new(Workload)
                .health(stateful_set_health)
                .children(crashing_pods)
                .wave(1)
                .gated(),
        ),
        (
            GroupKind::new(APPS, "DaemonSet"),
            KindDescriptor::new(Workload)
                .health(daemon_set_health)
                .children(crashing_pods)
                .wave(1)
                .gated(),
        ),
        (
            GroupKind::new(APPS, "ReplicaSet"),
            KindDescriptor::new(Workload)
                .health(replica_set_health)
                .children(crashing_pods)
                .wave(1)
                .gated(),
        ),
        (
            GroupKind::new(BATCH, "Job"),
            KindDescriptor::new(Workload).health(job_health).wave(1).gated(),
        ),
        (
            GroupKind::new(BATCH, "CronJob"),
            KindDescriptor::new(Workload).health(cron_job_health).wave(1),
        ),
        (
            GroupKind::core("Pod"),
            KindDescriptor::new(Workload).health(pod_health).wave(1).gated(),
        ),
        (
            GroupKind::new("autoscaling", "HorizontalPodAutoscaler"),
            KindDescriptor::new(Workload).wave(1),
        ),
        // Network and traffic
        (
            GroupKind::core("Service"),
            KindDescriptor::new(Network).health(service_health).wave(1),
        ),
        (
            GroupKind::new(NETWORKING, "NetworkPolicy"),
            KindDescriptor::new(Network).wave(1),
        ),
        (
            GroupKind::new(NETWORKING, "Ingress"),
            KindDescriptor::new(Network).health(ingress_health).wave(2),
        ),
        (
            GroupKind::new("gateway.networking.k8s.io", "HTTPRoute"),
            KindDescriptor::new(Network).wave(2),
        ),
    ]
}

fn int(value: &Value, pointer: &str) -> Option<i64> {
    value.pointer(pointer).and_then(Value::as_i64)
}

fn text<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn flag(value: &Value, pointer: &str) -> bool {
    value
        .pointer(pointer)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn condition<'a>(value: &'a Value, kind: &str) -> Option<&'a Value> {
    value
        .pointer("/status/conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
}

fn condition_is(value: &Value, kind: &str, status: &str) -> bool {
    condition(value, kind).and_then(|c| c.get("status").and_then(Value::as_str)) == Some(status)
}

fn condition_message(value: &Value, kind: &str) -> Option<String> {
    let c = condition(value, kind)?;
    let reason = c.get("reason").and_then(Value::as_str);
    let message = c.get("message").and_then(Value::as_str);
    match (reason, message) {
        (Some(r), Some(m)) => Some(format!("{r}: {m}")),
        (Some(r), None) => Some(r.to_string()),
        (None, Some(m)) => Some(m.to_string()),
        (None, None) => None,
    }
}

/// Rollout not yet observed by the workload controller
fn generation_pending(live: &Value) -> bool {
    match (
        int(live, "/metadata/generation"),
        int(live, "/status/observedGeneration"),
    ) {
        (Some(generation), Some(observed)) => observed < generation,
        _ => false,
    }
}

/// Existence-only rule: a live object is Healthy
pub fn existence_health(_live: &Value) -> HealthAssessment {
    HealthAssessment::healthy()
}

/// Ready replicas against desired, shared by replica-based workloads
fn replica_health(live: &Value) -> HealthAssessment {
    let desired = int(live, "/spec/replicas").unwrap_or(1);
    let ready = int(live, "/status/readyReplicas").unwrap_or(0);
    if ready < desired {
        return HealthAssessment::progressing(format!("{ready}/{desired} ready"));
    }
    if let Some(updated) = int(live, "/status/updatedReplicas")
        && updated < desired
    {
        return HealthAssessment::progressing(format!("{updated}/{desired} updated"));
    }
    HealthAssessment::healthy()
}

pub fn deployment_health(live: &Value) -> HealthAssessment {
    if flag(live, "/spec/paused") {
        return HealthAssessment::with_message(HealthStatus::Suspended, "deployment is paused");
    }
    if condition(live, "Progressing")
        .and_then(|c| c.get("reason").and_then(Value::as_str))
        == Some("ProgressDeadlineExceeded")
    {
        return HealthAssessment::degraded(
            condition_message(live, "Progressing")
                .unwrap_or_else(|| "progress deadline exceeded".to_string()),
        );
    }
    if condition_is(live, "ReplicaFailure", "True") {
        return HealthAssessment::degraded(
            condition_message(live, "ReplicaFailure")
                .unwrap_or_else(|| "replica failure".to_string()),
        );
    }
    if generation_pending(live) {
        return HealthAssessment::progressing("waiting for rollout to be observed");
    }
    replica_health(live)
}

pub fn stateful_set_health(live: &Value) -> HealthAssessment {
    if generation_pending(live) {
        return HealthAssessment::progressing("waiting for rollout to be observed");
    }
    let assessment = replica_health(live);
    if assessment.status != HealthStatus::Healthy {
        return assessment;
    }
    match (
        text(live, "/status/currentRevision"),
        text(live, "/status/updateRevision"),
    ) {
        (Some(current), Some(update)) if current != update => {
            HealthAssessment::progressing(format!("rolling update to {update} in progress"))
        }
        _ => assessment,
    }
}

pub fn replica_set_health(live: &Value) -> HealthAssessment {
    if condition_is(live, "ReplicaFailure", "True") {
        return HealthAssessment::degraded(
            condition_message(live, "ReplicaFailure")
                .unwrap_or_else(|| "replica failure".to_string()),
        );
    }
    replica_health(live)
}

pub fn daemon_set_health(live: &Value) -> HealthAssessment {
    if generation_pending(live) {
        return HealthAssessment::progressing("waiting for rollout to be observed");
    }
    let Some(desired) = int(live, "/status/desiredNumberScheduled") else {
        return HealthAssessment::progressing("waiting for pods to be scheduled");
    };
    let ready = int(live, "/status/numberReady").unwrap_or(0);
    if ready < desired {
        return HealthAssessment::progressing(format!("{ready}/{desired} ready"));
    }
    if let Some(updated) = int(live, "/status/updatedNumberScheduled")
        && updated < desired
    {
        return HealthAssessment::progressing(format!("{updated}/{desired} updated"));
    }
    HealthAssessment::healthy()
}

pub fn job_health(live: &Value) -> HealthAssessment {
    if flag(live, "/spec/suspend") {
        return HealthAssessment::with_message(HealthStatus::Suspended, "job is suspended");
    }
    if condition_is(live, "Failed", "True") {
        return HealthAssessment::degraded(
            condition_message(live, "Failed").unwrap_or_else(|| "job failed".to_string()),
        );
    }
    let failed = int(live, "/status/failed").unwrap_or(0);
    let backoff_limit = int(live, "/spec/backoffLimit").unwrap_or(6);
    if failed > backoff_limit {
        return HealthAssessment::degraded(format!(
            "failed {failed} times, backoff limit is {backoff_limit}"
        ));
    }
    if condition_is(live, "Complete", "True") {
        return HealthAssessment::healthy();
    }
    let completions = int(live, "/spec/completions").unwrap_or(1);
    let succeeded = int(live, "/status/succeeded").unwrap_or(0);
    if succeeded >= completions {
        HealthAssessment::healthy()
    } else {
        HealthAssessment::progressing(format!("{succeeded}/{completions} completed"))
    }
}

fn cron_job_health(live: &Value) -> HealthAssessment {
    if flag(live, "/spec/suspend") {
        HealthAssessment::with_message(HealthStatus::Suspended, "cron job is suspended")
    } else {
        HealthAssessment::healthy()
    }
}

pub fn pod_health(live: &Value) -> HealthAssessment {
    let statuses = live
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for container in statuses {
        if let Some(reason) = text(container, "/state/waiting/reason")
            && CRASH_REASONS.contains(&reason)
        {
            let name = text(container, "/name").unwrap_or("container");
            return HealthAssessment::degraded(format!("{name}: {reason}"));
        }
    }

    match text(live, "/status/phase") {
        Some("Succeeded") => HealthAssessment::healthy(),
        Some("Failed") => HealthAssessment::degraded(
            text(live, "/status/message").unwrap_or("pod failed").to_string(),
        ),
        Some("Running") if condition_is(live, "Ready", "True") => HealthAssessment::healthy(),
        Some("Running") => HealthAssessment::progressing("containers not ready"),
        _ => HealthAssessment::progressing("pod pending"),
    }
}

/// Whether `pod` belongs to a workload, by owner uid or label selector
fn owned_by(pod: &Value, uid: Option<&str>, selector: Option<&Map<String, Value>>) -> bool {
    let by_reference = uid.is_some_and(|uid| {
        pod.pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
            .is_some_and(|refs| refs.iter().any(|r| text(r, "/uid") == Some(uid)))
    });
    let by_selector = selector.is_some_and(|selector| {
        pod.pointer("/metadata/labels")
            .and_then(Value::as_object)
            .is_some_and(|labels| selector.iter().all(|(k, v)| labels.get(k) == Some(v)))
    });
    by_reference || by_selector
}

/// Degrade a workload while any of its pods is crashing
///
/// Pods of a Deployment are owned by its ReplicaSets, so ownership is
/// matched through the selector as well as the owner uid.
pub fn crashing_pods(owner: &Value, neighbours: &[&Value]) -> Option<HealthAssessment> {
    let namespace = text(owner, "/metadata/namespace");
    let uid = text(owner, "/metadata/uid");
    let selector = owner
        .pointer("/spec/selector/matchLabels")
        .and_then(Value::as_object)
        .filter(|labels| !labels.is_empty());

    neighbours
        .iter()
        .copied()
        .filter(|object| text(object, "/kind") == Some("Pod"))
        .filter(|pod| text(pod, "/metadata/namespace") == namespace)
        .filter(|pod| owned_by(pod, uid, selector))
        .find_map(|pod| {
            let health = pod_health(pod);
            (health.status == HealthStatus::Degraded).then(|| {
                let name = text(pod, "/metadata/name").unwrap_or("pod");
                HealthAssessment::degraded(format!("pod {name}: {}", health.describe()))
            })
        })
}

pub fn pvc_health(live: &Value) -> HealthAssessment {
    match text(live, "/status/phase") {
        Some("Bound") => HealthAssessment::healthy(),
        Some("Lost") => HealthAssessment::degraded("claim lost its volume"),
        _ => HealthAssessment::progressing("waiting for volume binding"),
    }
}

fn has_load_balancer_address(live: &Value) -> bool {
    live.pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty())
}

pub fn service_health(live: &Value) -> HealthAssessment {
    if text(live, "/spec/type") == Some("LoadBalancer") && !has_load_balancer_address(live) {
        return HealthAssessment::progressing("waiting for load balancer");
    }
    HealthAssessment::healthy()
}

pub fn ingress_health(live: &Value) -> HealthAssessment {
    if has_load_balancer_address(live) {
        HealthAssessment::healthy()
    } else {
        HealthAssessment::progressing("waiting for ingress address")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deployment_ready() {
        let live = json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "readyReplicas": 3, "updatedReplicas": 3}
        });
        assert_eq!(deployment_health(&live).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_deployment_partially_ready() {
        let live = json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 1}});
        let assessment = deployment_health(&live);
        assert_eq!(assessment.status, HealthStatus::Progressing);
        assert_eq!(assessment.message.as_deref(), Some("1/3 ready"));
    }

    #[test]
    fn test_deployment_deadline_exceeded() {
        let live = json!({
            "spec": {"replicas": 1},
            "status": {"conditions": [{
                "type": "Progressing",
                "status": "False",
                "reason": "ProgressDeadlineExceeded",
                "message": "ReplicaSet has timed out progressing"
            }]}
        });
        let assessment = deployment_health(&live);
        assert_eq!(assessment.status, HealthStatus::Degraded);
        assert!(assessment.describe().contains("ProgressDeadlineExceeded"));
    }

    #[test]
    fn test_deployment_paused() {
        let live = json!({"spec": {"replicas": 1, "paused": true}});
        assert_eq!(deployment_health(&live).status, HealthStatus::Suspended);
    }

    #[test]
    fn test_deployment_generation_pending() {
        let live = json!({
            "metadata": {"generation": 3},
            "spec": {"replicas": 1},
            "status": {"observedGeneration": 2, "readyReplicas": 1}
        });
        assert_eq!(deployment_health(&live).status, HealthStatus::Progressing);
    }

    #[test]
    fn test_stateful_set_revision_rollout() {
        let live = json!({
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2, "currentRevision": "web-1", "updateRevision": "web-2"}
        });
        assert_eq!(stateful_set_health(&live).status, HealthStatus::Progressing);
    }

    #[test]
    fn test_daemon_set() {
        let pending = json!({"status": {}});
        assert_eq!(daemon_set_health(&pending).status, HealthStatus::Progressing);

        let ready = json!({"status": {"desiredNumberScheduled": 3, "numberReady": 3}});
        assert_eq!(daemon_set_health(&ready).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_job_lifecycle() {
        let running = json!({"spec": {}, "status": {"active": 1}});
        assert_eq!(job_health(&running).status, HealthStatus::Progressing);

        let done = json!({"spec": {}, "status": {"succeeded": 1}});
        assert_eq!(job_health(&done).status, HealthStatus::Healthy);

        let failed = json!({
            "spec": {"backoffLimit": 2},
            "status": {"failed": 3}
        });
        assert_eq!(job_health(&failed).status, HealthStatus::Degraded);

        let condition = json!({
            "status": {"conditions": [{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded"}]}
        });
        assert_eq!(
            job_health(&condition).message.as_deref(),
            Some("BackoffLimitExceeded")
        );
    }

    #[test]
    fn test_pod_crash_loop() {
        let live = json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [{"name": "app", "state": {"waiting": {"reason": "CrashLoopBackOff"}}}]
            }
        });
        let assessment = pod_health(&live);
        assert_eq!(assessment.status, HealthStatus::Degraded);
        assert_eq!(assessment.message.as_deref(), Some("app: CrashLoopBackOff"));
    }

    fn crash_looping_pod(name: &str, namespace: &str, labels: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": namespace, "labels": labels},
            "status": {
                "phase": "Running",
                "containerStatuses": [{"name": "app", "state": {"waiting": {"reason": "CrashLoopBackOff"}}}]
            }
        })
    }

    #[test]
    fn test_crashing_pods_by_selector() {
        let owner = json!({
            "metadata": {"name": "web", "namespace": "shop", "uid": "d-1"},
            "spec": {"replicas": 2, "selector": {"matchLabels": {"app": "web"}}}
        });
        let crashing = crash_looping_pod("web-5c9f-abc", "shop", json!({"app": "web", "pod-template-hash": "5c9f"}));
        let elsewhere = crash_looping_pod("web-5c9f-def", "other", json!({"app": "web"}));
        let unrelated = crash_looping_pod("api-1", "shop", json!({"app": "api"}));

        assert_eq!(crashing_pods(&owner, &[&elsewhere, &unrelated]), None);

        let assessment = crashing_pods(&owner, &[&unrelated, &crashing]).unwrap();
        assert_eq!(assessment.status, HealthStatus::Degraded);
        assert_eq!(
            assessment.message.as_deref(),
            Some("pod web-5c9f-abc: app: CrashLoopBackOff")
        );
    }

    #[test]
    fn test_crashing_pods_by_owner_reference() {
        let owner = json!({"metadata": {"name": "db", "namespace": "shop", "uid": "s-1"}, "spec": {}});
        let mut pod = crash_looping_pod("db-0", "shop", json!({}));
        pod["metadata"]["ownerReferences"] = json!([{"kind": "StatefulSet", "name": "db", "uid": "s-1"}]);
        assert!(crashing_pods(&owner, &[&pod]).is_some());

        pod["metadata"]["ownerReferences"] = json!([{"kind": "StatefulSet", "name": "db", "uid": "s-2"}]);
        assert!(crashing_pods(&owner, &[&pod]).is_none());
    }

    #[test]
    fn test_pod_ready() {
        let live = json!({
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
        });
        assert_eq!(pod_health(&live).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_service_load_balancer() {
        let waiting = json!({"spec": {"type": "LoadBalancer"}, "status": {}});
        assert_eq!(service_health(&waiting).status, HealthStatus::Progressing);

        let cluster_ip = json!({"spec": {"type": "ClusterIP"}});
        assert_eq!(service_health(&cluster_ip).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_pvc() {
        assert_eq!(
            pvc_health(&json!({"status": {"phase": "Bound"}})).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            pvc_health(&json!({"status": {"phase": "Lost"}})).status,
            HealthStatus::Degraded
        );
    }
}
