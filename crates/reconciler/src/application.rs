//! Applications and the reconcile decision
//!
//! [`decide`] is a pure function: given what the controller knows about an
//! application it says whether a sync should start. Locking, rendering and
//! diffing happen around it in the controller.

use crate::diff::IgnoreRule;
use crate::operation::{History, SyncOperation, SyncTrigger};
use crate::resource::ManagedResource;
use crate::retry::RetryPolicy;
use crate::types::{
    DiffAction, DiffStatus, HealthAssessment, HealthStatus, HookRole, ResourceKey, SyncStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Where the rendered manifests come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: PathBuf,
    /// Target revision
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRef {
    pub name: String,
    /// Default namespace for namespaced resources that name none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutomatedPolicy {
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub self_heal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// None means manual sync only
    #[serde(default)]
    pub automated: Option<AutomatedPolicy>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SyncPolicy {
    pub fn is_automated(&self) -> bool {
        self.automated.is_some()
    }

    pub fn prune(&self) -> bool {
        self.automated.is_some_and(|a| a.prune)
    }

    pub fn self_heal(&self) -> bool {
        self.automated.is_some_and(|a| a.self_heal)
    }
}

/// A reconciliation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub source: SourceRef,
    pub destination: DestinationRef,
    #[serde(default)]
    pub policy: SyncPolicy,
    #[serde(default)]
    pub ignore_differences: Vec<IgnoreRule>,
}

impl Application {
    /// A manual-sync application
    pub fn new(
        name: impl Into<String>,
        source_path: impl Into<PathBuf>,
        revision: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: SourceRef {
                path: source_path.into(),
                revision: revision.into(),
            },
            destination: DestinationRef {
                name: destination.into(),
                namespace: None,
            },
            policy: SyncPolicy::default(),
            ignore_differences: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.destination.namespace = Some(namespace.into());
        self
    }

    pub fn with_automated(mut self, prune: bool, self_heal: bool) -> Self {
        self.policy.automated = Some(AutomatedPolicy { prune, self_heal });
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.policy.retry = retry;
        self
    }

    pub fn with_ignore(mut self, rule: IgnoreRule) -> Self {
        self.ignore_differences.push(rule);
        self
    }
}

/// Status of one managed resource, as reported to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub key: ResourceKey,
    pub wave: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookRole>,
    pub sync: DiffStatus,
    pub action: DiffAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthAssessment>,
    /// JSON pointers of the differing fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<String>,
    /// Changed by someone other than the controller
    #[serde(default)]
    pub foreign: bool,
}

impl From<&ManagedResource> for ResourceStatus {
    fn from(resource: &ManagedResource) -> Self {
        Self {
            key: resource.key.clone(),
            wave: resource.wave,
            hook: resource.hook,
            sync: resource.diff.status,
            action: resource.diff.action,
            health: resource.health.clone(),
            differences: resource.diff.paths(),
            foreign: resource.diff.foreign,
        }
    }
}

/// A desired-state identity: revision plus manifest digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionMark {
    pub revision: String,
    pub digest: String,
    pub at: DateTime<Utc>,
}

impl RevisionMark {
    pub fn new(revision: &str, digest: &str) -> Self {
        Self {
            revision: revision.to_string(),
            digest: digest.to_string(),
            at: Utc::now(),
        }
    }

    pub fn same_target(&self, revision: &str, digest: &str) -> bool {
        self.revision == revision && self.digest == digest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    /// Desired manifests could not be resolved or understood
    RenderError,
    /// Live state is unknown, comparison cannot be trusted
    ComparisonUnknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub message: String,
}

/// Everything the controller tracks for one application
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationStatus {
    #[serde(default)]
    pub sync: SyncStatus,
    #[serde(default)]
    pub health: HealthStatus,
    /// Revision and digest compared in the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<RevisionMark>,
    /// Last successfully synced desired state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<RevisionMark>,
    /// Desired state of the last automated attempt, successful or not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_automated: Option<RevisionMark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_self_heal_at: Option<DateTime<Utc>>,
    /// Latest operation, running or finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<SyncOperation>,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl ApplicationStatus {
    /// Revision of the last successful sync
    pub fn last_synced_revision(&self) -> Option<&str> {
        self.last_synced.as_ref().map(|m| m.revision.as_str())
    }

    pub fn operation_active(&self) -> bool {
        self.operation.as_ref().is_some_and(|op| op.phase.is_active())
    }

    pub fn next_operation_id(&self) -> u64 {
        let latest = self.operation.as_ref().map_or(0, |op| op.id);
        latest.max(self.history.last_id()) + 1
    }

    pub fn set_condition(&mut self, kind: ConditionKind, message: impl Into<String>) {
        let message = message.into();
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(condition) => condition.message = message,
            None => self.conditions.push(Condition { kind, message }),
        }
    }

    pub fn clear_condition(&mut self, kind: ConditionKind) {
        self.conditions.retain(|c| c.kind != kind);
    }

    /// Out-of-sync resources with their differing fields
    pub fn drifted(&self) -> impl Iterator<Item = &ResourceStatus> {
        self.resources
            .iter()
            .filter(|r| r.sync == DiffStatus::OutOfSync)
    }
}

/// Outcome of a reconciliation tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoAction,
    StartSync {
        revision: String,
        trigger: SyncTrigger,
    },
    AlreadySyncing,
}

/// Facts a reconciliation decision is based on
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub policy: &'a SyncPolicy,
    pub status: &'a ApplicationStatus,
    pub revision: &'a str,
    pub digest: &'a str,
    pub sync: SyncStatus,
    /// Out-of-sync resources a sync would actually change
    pub actionable_drift: bool,
    pub operation_active: bool,
    pub manual_requested: bool,
    /// Monotonic clock reading for this pass
    pub now: Instant,
    /// When the last self-heal operation started, on the same clock
    pub last_self_heal: Option<Instant>,
    pub self_heal_cooldown: Duration,
}

/// Decide whether a sync should start
///
/// An automated sync fires for a desired state (revision and digest) that
/// was never synced and was not already attempted automatically. Drift on
/// the already-synced state is only repaired by self-heal, at most once
/// per cooldown.
pub fn decide(input: &DecisionInput<'_>) -> Decision {
    classify(input).unwrap_or(Decision::NoAction)
}

/// When a self-heal is due but held back by the cooldown, the instant it
/// becomes allowed
pub fn self_heal_deferred_until(input: &DecisionInput<'_>) -> Option<Instant> {
    classify(input).err()
}

/// Err carries the end of the cooldown, the only thing blocking a self-heal
fn classify(input: &DecisionInput<'_>) -> Result<Decision, Instant> {
    if input.operation_active {
        return Ok(Decision::AlreadySyncing);
    }
    let start = |trigger| Decision::StartSync {
        revision: input.revision.to_string(),
        trigger,
    };
    if input.manual_requested {
        return Ok(start(SyncTrigger::Manual));
    }
    if !input.policy.is_automated() || input.sync != SyncStatus::OutOfSync || !input.actionable_drift {
        return Ok(Decision::NoAction);
    }

    let synced = input
        .status
        .last_synced
        .as_ref()
        .is_some_and(|m| m.same_target(input.revision, input.digest));
    if !synced {
        let attempted = input
            .status
            .last_automated
            .as_ref()
            .is_some_and(|m| m.same_target(input.revision, input.digest));
        return Ok(if attempted {
            Decision::NoAction
        } else {
            start(SyncTrigger::Automated)
        });
    }

    if !input.policy.self_heal() {
        return Ok(Decision::NoAction);
    }
    match input.last_self_heal.map(|at| at + input.self_heal_cooldown) {
        Some(until) if input.now < until => Err(until),
        _ => Ok(start(SyncTrigger::SelfHeal)),
    }
}
