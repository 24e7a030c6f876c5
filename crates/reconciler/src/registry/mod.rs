//! Resource registry - capability table keyed by kind
//!
//! Every kind the controller knows about is described by a plain
//! [`KindDescriptor`]: its health rule, default wave, apply tier and prune
//! weight, plus an optional rule over the objects it owns. New kinds are supported by registering a descriptor; nothing that
//! consults the registry needs to change. Lookups never fail: unknown kinds
//! get an existence-only health rule and wave 0.

mod builtin;

use crate::types::{GroupKind, HealthAssessment};
use serde_json::Value;
use std::collections::HashMap;

pub use builtin::{
    crashing_pods, daemon_set_health, deployment_health, existence_health, ingress_health,
    job_health, pod_health, pvc_health, replica_set_health, service_health, stateful_set_health,
};

/// Health rule: derives health from a live manifest
pub type HealthRule = fn(&Value) -> HealthAssessment;

/// Child rule: given an owner and the other live objects on its
/// destination, reports a problem with the objects it owns
pub type ChildRule = fn(&Value, &[&Value]) -> Option<HealthAssessment>;

/// Fixed apply order inside a wave
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KindTier {
    /// Namespaces and CRDs
    Foundation = 0,
    /// Config objects, RBAC and storage claims
    Config = 1,
    /// Workloads
    Workload = 2,
    /// Services, ingress and traffic shifting
    Network = 3,
    /// Kinds the registry does not know
    Other = 4,
}

/// Everything the controller needs to know about one kind
#[derive(Debug, Clone, Copy)]
pub struct KindDescriptor {
    pub health: HealthRule,
    /// Consulted while the owner itself looks Healthy or Progressing
    pub children: Option<ChildRule>,
    pub default_wave: i32,
    pub tier: KindTier,
    /// Higher weights are pruned first within a wave
    pub prune_weight: i32,
    /// Gated kinds must report Healthy before the next wave starts
    pub health_gated: bool,
    pub namespaced: bool,
}

impl KindDescriptor {
    /// A namespaced, non-gated kind with existence-only health
    pub fn new(tier: KindTier) -> Self {
        Self {
            health: existence_health,
            children: None,
            default_wave: 0,
            tier,
            prune_weight: tier as i32,
            health_gated: false,
            namespaced: true,
        }
    }

    pub fn health(mut self, rule: HealthRule) -> Self {
        self.health = rule;
        self
    }

    pub fn children(mut self, rule: ChildRule) -> Self {
        self.children = Some(rule);
        self
    }

    pub fn wave(mut self, wave: i32) -> Self {
        self.default_wave = wave;
        self
    }

    pub fn prune_weight(mut self, weight: i32) -> Self {
        self.prune_weight = weight;
        self
    }

    /// Require Healthy before the wave barrier is released
    pub fn gated(mut self) -> Self {
        self.health_gated = true;
        self
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }
}

impl Default for KindDescriptor {
    fn default() -> Self {
        Self::new(KindTier::Other)
    }
}

/// Read-only lookup table of kind descriptors
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    kinds: HashMap<GroupKind, KindDescriptor>,
    fallback: KindDescriptor,
}

impl ResourceRegistry {
    /// Registry with no kinds; every lookup returns the fallback
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
            fallback: KindDescriptor::default(),
        }
    }

    /// Registry preloaded with the built-in kinds
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (group_kind, descriptor) in builtin::descriptors() {
            registry.register(group_kind, descriptor);
        }
        registry
    }

    /// Register or replace a kind, returning the previous descriptor
    pub fn register(
        &mut self,
        group_kind: GroupKind,
        descriptor: KindDescriptor,
    ) -> Option<KindDescriptor> {
        self.kinds.insert(group_kind, descriptor)
    }

    /// Describe a kind; unknown kinds degrade to the fallback descriptor
    pub fn describe(&self, group_kind: &GroupKind) -> KindDescriptor {
        self.kinds
            .get(group_kind)
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn is_known(&self, group_kind: &GroupKind) -> bool {
        self.kinds.contains_key(group_kind)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HealthStatus;
    use serde_json::json;

    #[test]
    fn test_unknown_kind_falls_back() {
        let registry = ResourceRegistry::builtin();
        let descriptor = registry.describe(&GroupKind::new("example.com", "Widget"));
        assert_eq!(descriptor.default_wave, 0);
        assert_eq!(descriptor.tier, KindTier::Other);
        assert!(!descriptor.health_gated);

        let live = json!({"kind": "Widget", "metadata": {"name": "w"}});
        assert_eq!((descriptor.health)(&live).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_builtin_ordering() {
        let registry = ResourceRegistry::builtin();
        let ns = registry.describe(&GroupKind::core("Namespace"));
        let deploy = registry.describe(&GroupKind::new("apps", "Deployment"));
        let ingress = registry.describe(&GroupKind::new("networking.k8s.io", "Ingress"));

        assert!(ns.default_wave < deploy.default_wave);
        assert!(deploy.default_wave < ingress.default_wave);
        assert!(ns.tier < deploy.tier);
        assert!(!ns.namespaced);
        assert!(deploy.health_gated);
        assert!(deploy.children.is_some());
        assert!(ns.children.is_none());
    }

    #[test]
    fn test_register_new_kind() {
        fn always_degraded(_: &Value) -> HealthAssessment {
            HealthAssessment::degraded("nope")
        }

        let mut registry = ResourceRegistry::empty();
        let kind = GroupKind::new("example.com", "Widget");
        assert!(!registry.is_known(&kind));

        let previous = registry.register(
            kind.clone(),
            KindDescriptor::new(KindTier::Workload)
                .health(always_degraded)
                .wave(7)
                .gated(),
        );
        assert!(previous.is_none());

        let descriptor = registry.describe(&kind);
        assert_eq!(descriptor.default_wave, 7);
        assert_eq!(
            (descriptor.health)(&json!({})).status,
            HealthStatus::Degraded
        );
    }
}
