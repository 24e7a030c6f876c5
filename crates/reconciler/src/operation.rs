//! Sync operations and their bounded history

use crate::types::{HookRole, ResourceKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Lifecycle of a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperationPhase {
    #[default]
    Pending,
    Running,
    /// Abort requested, waiting for in-flight calls
    Terminating,
    Succeeded,
    Failed,
    Error,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Error)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What started an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTrigger {
    Manual,
    Automated,
    SelfHeal,
    Rollback,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Automated => "automated",
            Self::SelfHeal => "self-heal",
            Self::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// What the operation did to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskAction {
    Apply,
    Prune,
    Hook,
}

/// Outcome for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    /// Planned but not started yet
    Pending,
    /// Accepted by the destination
    Applied,
    /// Applied and reported Healthy
    Healthy,
    /// Hook ran to completion
    Completed,
    Pruned,
    /// Prune candidate left alone
    PruneSkipped,
    /// Not executed (dry run, abort, earlier failure)
    Skipped,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub key: ResourceKey,
    pub wave: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookRole>,
    pub action: TaskAction,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl ResourceResult {
    /// Human-readable reason line
    pub fn describe(&self) -> String {
        match &self.message {
            Some(message) => format!("{} {}: {message}", self.status, self.key),
            None => format!("{} {}", self.status, self.key),
        }
    }
}

/// One execution attempt to converge an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: u64,
    pub app: String,
    pub revision: String,
    pub digest: String,
    pub trigger: SyncTrigger,
    pub phase: OperationPhase,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_wave: Option<i32>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub results: Vec<ResourceResult>,
}

impl SyncOperation {
    pub fn new(id: u64, app: &str, revision: &str, digest: &str, trigger: SyncTrigger) -> Self {
        Self {
            id,
            app: app.to_string(),
            revision: revision.to_string(),
            digest: digest.to_string(),
            trigger,
            phase: OperationPhase::Pending,
            started_at: Utc::now(),
            finished_at: None,
            current_wave: None,
            retry_count: 0,
            message: None,
            dry_run: false,
            prune: false,
            results: Vec::new(),
        }
    }

    /// Result entry for `key`, created on first use
    pub fn result_mut(
        &mut self,
        key: &ResourceKey,
        hook: Option<HookRole>,
        action: TaskAction,
        wave: i32,
    ) -> &mut ResourceResult {
        let index = match self
            .results
            .iter()
            .position(|r| r.key == *key && r.hook == hook && r.action == action)
        {
            Some(index) => index,
            None => {
                self.results.push(ResourceResult {
                    key: key.clone(),
                    wave,
                    hook,
                    action,
                    status: ResultStatus::Pending,
                    message: None,
                    attempts: 0,
                });
                self.results.len() - 1
            }
        };
        &mut self.results[index]
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceResult> {
        self.results
            .iter()
            .filter(|r| r.status == ResultStatus::Failed)
    }

    /// Mark the operation finished
    pub fn finish(&mut self, phase: OperationPhase, message: impl Into<String>) {
        self.phase = phase;
        self.message = Some(message.into());
        self.finished_at = Some(Utc::now());
        for result in &mut self.results {
            if result.status == ResultStatus::Pending {
                result.status = ResultStatus::Skipped;
            }
        }
    }

    /// Per-resource reason list for display
    pub fn reasons(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.message.is_some())
            .map(ResourceResult::describe)
            .collect()
    }
}

/// Summary of a finished operation kept in history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub revision: String,
    pub digest: String,
    pub trigger: SyncTrigger,
    pub phase: OperationPhase,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_wave: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl From<&SyncOperation> for HistoryEntry {
    fn from(op: &SyncOperation) -> Self {
        Self {
            id: op.id,
            revision: op.revision.clone(),
            digest: op.digest.clone(),
            trigger: op.trigger,
            phase: op.phase,
            started_at: op.started_at,
            finished_at: op.finished_at,
            current_wave: op.current_wave,
            message: op.message.clone(),
            reasons: op.reasons(),
        }
    }
}

/// Append-only operation history with bounded retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub limit: usize,
    #[serde(default)]
    entries: VecDeque<HistoryEntry>,
}

impl Default for History {
    fn default() -> Self {
        Self::new(10)
    }
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Record a finished operation, dropping the oldest beyond the limit
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// Entries newest first
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> u64 {
        self.entries.back().map_or(0, |e| e.id)
    }

    /// Most recent successful entry for `revision`
    pub fn succeeded(&self, revision: &str) -> Option<&HistoryEntry> {
        self.entries()
            .find(|e| e.revision == revision && e.phase == OperationPhase::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, revision: &str, phase: OperationPhase) -> HistoryEntry {
        let mut op = SyncOperation::new(id, "web", revision, "d", SyncTrigger::Manual);
        op.finish(phase, "done");
        HistoryEntry::from(&op)
    }

    #[test]
    fn test_history_retention() {
        let mut history = History::new(3);
        for id in 1..=5 {
            history.push(entry(id, &format!("r{id}"), OperationPhase::Succeeded));
        }
        let ids: Vec<u64> = history.entries().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(history.last_id(), 5);
    }

    #[test]
    fn test_succeeded_lookup_skips_failures() {
        let mut history = History::new(10);
        history.push(entry(1, "r1", OperationPhase::Succeeded));
        history.push(entry(2, "r2", OperationPhase::Failed));
        assert_eq!(history.succeeded("r1").map(|e| e.id), Some(1));
        assert!(history.succeeded("r2").is_none());
    }

    #[test]
    fn test_finish_skips_pending_results() {
        let key = ResourceKey::new("", "ConfigMap", Some("web"), "cfg");
        let mut op = SyncOperation::new(1, "web", "r1", "d", SyncTrigger::Automated);
        op.result_mut(&key, None, TaskAction::Apply, 0);
        op.result_mut(&key, None, TaskAction::Apply, 0).attempts = 2;
        assert_eq!(op.results.len(), 1);

        op.finish(OperationPhase::Error, "operation aborted");
        assert_eq!(op.results[0].status, ResultStatus::Skipped);
        assert!(op.phase.is_terminal());
        assert!(op.finished_at.is_some());
    }
}
