//! Persisted controller state: per-application status and operation history

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reconciler::{ApplicationStatus, Controller};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncwaveState {
    /// Status of each application, keyed by name
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationStatus>,

    /// Last time the state was updated
    pub last_updated: DateTime<Utc>,
}

impl Default for SyncwaveState {
    fn default() -> Self {
        Self {
            applications: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl SyncwaveState {
    fn state_file(dir: &Path) -> PathBuf {
        dir.join(STATE_FILE)
    }

    /// Load state from `dir`, or return default if there is none yet
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::state_file(dir);

        if !path.exists() {
            log::debug!("State file does not exist, using default state");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!("Loaded state from {}", path.display());
        Ok(state)
    }

    /// Save state to `dir`
    ///
    /// Writes a sibling temp file first so a crash never leaves half a file.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let path = Self::state_file(dir);
        let content = toml::to_string_pretty(&self).context("Failed to serialize state to TOML")?;

        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, &content)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace state file: {}", path.display()))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Seed a controller with the saved status of its registered applications
    pub fn restore(&self, controller: &Controller) -> Result<()> {
        for name in controller.applications() {
            if let Some(status) = self.applications.get(&name) {
                controller
                    .restore_status(&name, status.clone())
                    .with_context(|| format!("Failed to restore status of {name}"))?;
            }
        }
        Ok(())
    }

    /// Snapshot the controller's current status
    ///
    /// Applications no longer registered are dropped.
    pub fn capture(controller: &Controller) -> Self {
        let applications = controller
            .applications()
            .into_iter()
            .filter_map(|name| {
                let status = controller.status(&name).ok()?;
                Some((name, status))
            })
            .collect();
        Self {
            applications,
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconciler::{
        ConditionKind, HistoryEntry, OperationPhase, SyncOperation, SyncStatus, SyncTrigger,
    };
    use tempfile::TempDir;

    fn sample_status() -> ApplicationStatus {
        let mut op = SyncOperation::new(3, "guestbook", "v2", "abc123", SyncTrigger::Manual);
        op.finish(OperationPhase::Succeeded, "successfully synced 2 resources");

        let mut status = ApplicationStatus {
            sync: SyncStatus::Synced,
            ..ApplicationStatus::default()
        };
        status.history.push(HistoryEntry::from(&op));
        status.operation = Some(op);
        status.set_condition(ConditionKind::ComparisonUnknown, "live state of local is Stale");
        status
    }

    #[test]
    fn test_missing_state_is_default() {
        let dir = TempDir::new().unwrap();
        let state = SyncwaveState::load(dir.path()).unwrap();
        assert!(state.applications.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut state = SyncwaveState::default();
        state
            .applications
            .insert("guestbook".to_string(), sample_status());
        state.save(dir.path()).unwrap();

        let loaded = SyncwaveState::load(dir.path()).unwrap();
        assert_eq!(loaded.applications, state.applications);
        assert!(!dir.path().join("state.toml.tmp").exists());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE), "applications = 3").unwrap();
        assert!(SyncwaveState::load(dir.path()).is_err());
    }
}
