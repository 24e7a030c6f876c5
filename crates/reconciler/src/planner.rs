//! Sync planner - orders diffed resources into waves, tiers and hook phases

use crate::manifest;
use crate::operation::TaskAction;
use crate::registry::{KindTier, ResourceRegistry};
use crate::resource::ManagedResource;
use crate::types::{DiffAction, DiffStatus, HookRole, ResourceKey};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One unit of work for the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTask {
    pub key: ResourceKey,
    /// Desired manifest for apply and hooks, live manifest for prune
    pub manifest: Value,
    pub action: TaskAction,
    pub hook: Option<HookRole>,
    pub wave: i32,
    pub tier: KindTier,
    pub prune_weight: i32,
    /// Must report Healthy before the wave completes
    pub gated: bool,
}

impl SyncTask {
    fn from_resource(resource: &ManagedResource, registry: &ResourceRegistry, action: TaskAction) -> Option<Self> {
        let manifest = match action {
            TaskAction::Prune => resource.live.clone()?,
            TaskAction::Apply | TaskAction::Hook => resource.desired.clone()?,
        };
        let descriptor = registry.describe(&resource.key.group_kind());
        Some(Self {
            key: resource.key.clone(),
            manifest,
            action,
            hook: resource.hook,
            wave: resource.wave,
            tier: descriptor.tier,
            prune_weight: descriptor.prune_weight,
            gated: descriptor.health_gated,
        })
    }

    fn apply_order(&self) -> (KindTier, &str, Option<&str>, &str) {
        (
            self.tier,
            self.key.kind.as_str(),
            self.key.namespace.as_deref(),
            self.key.name.as_str(),
        )
    }
}

/// Work for one wave
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WavePlan {
    pub wave: i32,
    pub pre_sync: Vec<SyncTask>,
    /// Apply tasks grouped by kind tier, lowest tier first
    pub tiers: Vec<Vec<SyncTask>>,
    /// Sync-phase hooks, run after the tiers are applied
    pub sync_hooks: Vec<SyncTask>,
}

impl WavePlan {
    pub fn apply_tasks(&self) -> impl Iterator<Item = &SyncTask> {
        self.tiers.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.pre_sync.is_empty() && self.tiers.is_empty() && self.sync_hooks.is_empty()
    }
}

/// A prune candidate left alone, with the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPrune {
    pub key: ResourceKey,
    pub wave: i32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanOptions {
    pub prune: bool,
    /// Restrict to these resources; hooks do not run for selective syncs
    pub only: Option<BTreeSet<ResourceKey>>,
    /// Apply every desired resource, not just out-of-sync ones
    pub force_apply: bool,
}

/// Complete, ordered plan for one sync operation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncPlan {
    /// Ascending wave order
    pub waves: Vec<WavePlan>,
    /// Descending wave, then descending prune weight
    pub prune: Vec<SyncTask>,
    pub post_sync: Vec<SyncTask>,
    pub sync_fail: Vec<SyncTask>,
    pub skipped_prunes: Vec<SkippedPrune>,
}

impl SyncPlan {
    /// Build a plan from diffed resources
    ///
    /// Only out-of-sync resources are applied unless `force_apply` is set
    /// (used when the live cache cannot be trusted).
    pub fn build(resources: &[ManagedResource], registry: &ResourceRegistry, opts: &PlanOptions) -> Self {
        let selected = |r: &&ManagedResource| opts.only.as_ref().is_none_or(|only| only.contains(&r.key));
        let run_hooks = opts.only.is_none();

        let mut waves: BTreeMap<i32, WavePlan> = BTreeMap::new();
        let mut plan = Self::default();

        for resource in resources.iter().filter(selected) {
            if let Some(role) = resource.hook {
                if !run_hooks || resource.desired.is_none() {
                    continue;
                }
                let Some(task) = SyncTask::from_resource(resource, registry, TaskAction::Hook) else {
                    continue;
                };
                match role {
                    HookRole::PreSync => wave_entry(&mut waves, task.wave).pre_sync.push(task),
                    HookRole::Sync => wave_entry(&mut waves, task.wave).sync_hooks.push(task),
                    HookRole::PostSync => plan.post_sync.push(task),
                    HookRole::SyncFail => plan.sync_fail.push(task),
                }
                continue;
            }

            match resource.diff.action {
                DiffAction::Prune => {
                    let Some(task) = SyncTask::from_resource(resource, registry, TaskAction::Prune) else {
                        continue;
                    };
                    if !opts.prune {
                        plan.skip_prune(task, "pruning disabled");
                    } else if manifest::prune_disabled(&task.manifest) {
                        plan.skip_prune(task, "Prune=false");
                    } else {
                        plan.prune.push(task);
                    }
                }
                DiffAction::Create | DiffAction::Update | DiffAction::None => {
                    let changed = resource.diff.status != DiffStatus::InSync;
                    if !(changed || opts.force_apply) {
                        continue;
                    }
                    if let Some(task) = SyncTask::from_resource(resource, registry, TaskAction::Apply) {
                        wave_entry(&mut waves, task.wave).tiers.push(vec![task]);
                    }
                }
            }
        }

        plan.waves = waves.into_values().map(group_tiers).collect();
        plan.prune.sort_by(|a, b| {
            b.wave
                .cmp(&a.wave)
                .then_with(|| b.prune_weight.cmp(&a.prune_weight))
                .then_with(|| b.key.cmp(&a.key))
        });
        for hooks in [&mut plan.post_sync, &mut plan.sync_fail] {
            hooks.sort_by(|a, b| a.wave.cmp(&b.wave).then_with(|| a.key.cmp(&b.key)));
        }
        plan
    }

    fn skip_prune(&mut self, task: SyncTask, reason: &str) {
        self.skipped_prunes.push(SkippedPrune {
            key: task.key,
            wave: task.wave,
            reason: reason.to_string(),
        });
    }

    /// Number of mutating tasks, hooks included
    pub fn task_count(&self) -> usize {
        self.waves
            .iter()
            .map(|w| w.pre_sync.len() + w.sync_hooks.len() + w.apply_tasks().count())
            .sum::<usize>()
            + self.prune.len()
            + self.post_sync.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }
}

fn wave_entry(waves: &mut BTreeMap<i32, WavePlan>, wave: i32) -> &mut WavePlan {
    waves.entry(wave).or_insert_with(|| WavePlan {
        wave,
        ..WavePlan::default()
    })
}

/// Flatten single-task tiers into one group per kind tier, in apply order
fn group_tiers(mut wave: WavePlan) -> WavePlan {
    let mut tasks: Vec<SyncTask> = wave.tiers.drain(..).flatten().collect();
    tasks.sort_by(|a, b| a.apply_order().cmp(&b.apply_order()));

    let mut grouped: Vec<Vec<SyncTask>> = Vec::new();
    for task in tasks {
        match grouped.last_mut() {
            Some(group) if group[0].tier == task.tier => group.push(task),
            _ => grouped.push(vec![task]),
        }
    }
    wave.tiers = grouped;
    for hooks in [&mut wave.pre_sync, &mut wave.sync_hooks] {
        hooks.sort_by(|a, b| a.apply_order().cmp(&b.apply_order()));
    }
    wave
}

/// Parse a target like `Kind`, `Kind/name` or `Kind/namespace/name`
pub fn parse_target(target: &str) -> (String, Option<String>, Option<String>) {
    let parts: Vec<&str> = target.split('/').collect();
    match parts.as_slice() {
        [kind] => ((*kind).to_string(), None, None),
        [kind, name] => ((*kind).to_string(), None, Some((*name).to_string())),
        [kind, namespace, name] => (
            (*kind).to_string(),
            Some((*namespace).to_string()),
            Some((*name).to_string()),
        ),
        _ => (target.to_string(), None, None),
    }
}

/// Keys of resources matching any of the targets (case-insensitive kind)
pub fn select_targets(resources: &[ManagedResource], targets: &[String]) -> BTreeSet<ResourceKey> {
    let parsed: Vec<_> = targets.iter().map(|t| parse_target(t)).collect();
    resources
        .iter()
        .filter(|r| {
            parsed.iter().any(|(kind, namespace, name)| {
                r.key.kind.eq_ignore_ascii_case(kind)
                    && namespace
                        .as_ref()
                        .is_none_or(|ns| r.key.namespace.as_ref() == Some(ns))
                    && name.as_ref().is_none_or(|n| *n == r.key.name)
            })
        })
        .map(|r| r.key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffOutcome;
    use serde_json::json;

    fn resource(group: &str, kind: &str, name: &str, wave: i32, action: DiffAction) -> ManagedResource {
        let api_version = if group.is_empty() { "v1".to_string() } else { format!("{group}/v1") };
        let manifest = json!({"apiVersion": api_version, "kind": kind,
            "metadata": {"name": name, "namespace": "web"}});
        let key = ResourceKey::new(group, kind, Some("web"), name);
        let mut r = ManagedResource::from_desired(key, manifest.clone(), wave, None);
        r.diff = DiffOutcome {
            status: if action == DiffAction::None { DiffStatus::InSync } else { DiffStatus::OutOfSync },
            action,
            ..DiffOutcome::default()
        };
        if action == DiffAction::Prune {
            r.desired = None;
            r.live = Some(manifest);
        }
        r
    }

    fn hook(name: &str, role: HookRole, wave: i32) -> ManagedResource {
        let mut r = resource("batch", "Job", name, wave, DiffAction::Create);
        r.hook = Some(role);
        r
    }

    #[test]
    fn test_waves_and_tiers() {
        let registry = ResourceRegistry::builtin();
        let resources = vec![
            resource("networking.k8s.io", "Ingress", "web", 2, DiffAction::Create),
            resource("apps", "Deployment", "web", 1, DiffAction::Update),
            resource("", "Service", "web", 1, DiffAction::Create),
            resource("", "ConfigMap", "b", 1, DiffAction::Create),
            resource("", "ConfigMap", "a", 1, DiffAction::Create),
            resource("", "Secret", "unchanged", 1, DiffAction::None),
        ];
        let plan = SyncPlan::build(&resources, &registry, &PlanOptions::default());

        assert_eq!(plan.waves.iter().map(|w| w.wave).collect::<Vec<_>>(), vec![1, 2]);
        let tiers: Vec<Vec<String>> = plan.waves[0]
            .tiers
            .iter()
            .map(|t| t.iter().map(|task| format!("{}/{}", task.key.kind, task.key.name)).collect())
            .collect();
        assert_eq!(
            tiers,
            vec![
                vec!["ConfigMap/a".to_string(), "ConfigMap/b".to_string()],
                vec!["Deployment/web".to_string()],
                vec!["Service/web".to_string()],
            ]
        );
        assert!(plan.waves[0].tiers[1][0].gated);
        assert_eq!(plan.task_count(), 5);
    }

    #[test]
    fn test_force_apply_includes_in_sync() {
        let registry = ResourceRegistry::builtin();
        let resources = vec![resource("", "ConfigMap", "a", 0, DiffAction::None)];
        let opts = PlanOptions {
            force_apply: true,
            ..PlanOptions::default()
        };
        assert_eq!(SyncPlan::build(&resources, &registry, &opts).task_count(), 1);
        assert!(SyncPlan::build(&resources, &registry, &PlanOptions::default()).is_empty());
    }

    #[test]
    fn test_prune_order_and_skips() {
        let registry = ResourceRegistry::builtin();
        let mut protected = resource("", "Secret", "keep", 0, DiffAction::Prune);
        if let Some(live) = protected.live.as_mut() {
            manifest::set_annotation(live, manifest::SYNC_OPTIONS_ANNOTATION, "Prune=false");
        }
        let resources = vec![
            resource("", "ConfigMap", "cfg", 0, DiffAction::Prune),
            resource("apps", "Deployment", "old", 1, DiffAction::Prune),
            resource("", "Namespace", "legacy", 0, DiffAction::Prune),
            protected,
        ];

        let enabled = PlanOptions {
            prune: true,
            ..PlanOptions::default()
        };
        let plan = SyncPlan::build(&resources, &registry, &enabled);
        let order: Vec<&str> = plan.prune.iter().map(|t| t.key.name.as_str()).collect();
        assert_eq!(order, vec!["old", "cfg", "legacy"]);
        assert_eq!(plan.skipped_prunes.len(), 1);
        assert_eq!(plan.skipped_prunes[0].reason, "Prune=false");

        let disabled = SyncPlan::build(&resources, &registry, &PlanOptions::default());
        assert!(disabled.prune.is_empty());
        assert_eq!(disabled.skipped_prunes.len(), 4);
    }

    #[test]
    fn test_hooks_by_phase() {
        let registry = ResourceRegistry::builtin();
        let resources = vec![
            hook("migrate", HookRole::PreSync, 0),
            hook("smoke", HookRole::PostSync, 0),
            hook("notify", HookRole::SyncFail, 0),
            resource("", "ConfigMap", "cfg", 0, DiffAction::Create),
        ];
        let plan = SyncPlan::build(&resources, &registry, &PlanOptions::default());
        assert_eq!(plan.waves.len(), 1);
        assert_eq!(plan.waves[0].pre_sync[0].key.name, "migrate");
        assert_eq!(plan.post_sync[0].key.name, "smoke");
        assert_eq!(plan.sync_fail[0].key.name, "notify");

        // Selective syncs skip hooks
        let only = PlanOptions {
            only: Some(select_targets(&resources, &["configmap/cfg".to_string()])),
            ..PlanOptions::default()
        };
        let plan = SyncPlan::build(&resources, &registry, &only);
        assert_eq!(plan.task_count(), 1);
        assert!(plan.post_sync.is_empty());
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("Deployment"), ("Deployment".to_string(), None, None));
        assert_eq!(
            parse_target("Deployment/web"),
            ("Deployment".to_string(), None, Some("web".to_string()))
        );
        assert_eq!(
            parse_target("Deployment/prod/web"),
            ("Deployment".to_string(), Some("prod".to_string()), Some("web".to_string()))
        );
    }
}
