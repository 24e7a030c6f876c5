//! TOML configuration: controller tuning, destinations and applications

use anyhow::{Context, Result, bail};
use reconciler::{
    Application, ControllerConfig, IgnoreRule, ObserverConfig, RetryPolicy, SyncSettings,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

/// Root of `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncwaveConfig {
    pub controller: ControllerSection,
    pub observer: ObserverSection,
    pub sync: SyncSection,
    pub destinations: Vec<DestinationConfig>,
    pub applications: Vec<ApplicationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSection {
    pub concurrency: usize,
    pub operation_processors: usize,
    pub resync_interval_secs: u64,
    pub history_limit: usize,
    pub self_heal_cooldown_secs: u64,
    /// Where application status is persisted
    pub state_dir: Option<String>,
}

impl Default for ControllerSection {
    fn default() -> Self {
        let defaults = ControllerConfig::default();
        Self {
            concurrency: defaults.concurrency,
            operation_processors: defaults.operation_processors,
            resync_interval_secs: defaults.resync_interval.as_secs(),
            history_limit: defaults.history_limit,
            self_heal_cooldown_secs: defaults.self_heal_cooldown.as_secs(),
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObserverSection {
    pub resync_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub staleness_bound_secs: u64,
    pub event_buffer: usize,
}

impl Default for ObserverSection {
    fn default() -> Self {
        let defaults = ObserverConfig::default();
        Self {
            resync_interval_secs: defaults.resync_interval.as_secs(),
            poll_interval_secs: defaults.poll_interval.as_secs(),
            staleness_bound_secs: defaults.staleness_bound.as_secs(),
            event_buffer: defaults.event_buffer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub wave_timeout_secs: u64,
    pub hook_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
    pub max_inflight_per_destination: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncSettings::default();
        Self {
            wave_timeout_secs: defaults.wave_timeout.as_secs(),
            hook_timeout_secs: defaults.hook_timeout.as_secs(),
            operation_timeout_secs: defaults.operation_timeout.as_secs(),
            health_poll_interval_ms: defaults.health_poll_interval.as_millis() as u64,
            max_inflight_per_destination: ControllerConfig::default().max_inflight_per_destination,
        }
    }
}

/// A directory-backed destination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub name: String,
    pub path: String,
    /// Namespace for applications that name none
    #[serde(default)]
    pub namespace: Option<String>,
    /// Bring workloads to ready as soon as they are applied
    #[serde(default)]
    pub settle: bool,
}

impl DestinationConfig {
    pub fn root(&self) -> PathBuf {
        paths::expand(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    pub name: String,
    pub source: SourceConfig,
    pub destination: AppDestinationConfig,
    #[serde(default)]
    pub sync_policy: SyncPolicyConfig,
    #[serde(default)]
    pub ignore_differences: Vec<IgnoreRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub path: String,
    pub revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppDestinationConfig {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncPolicyConfig {
    pub automated: bool,
    pub prune: bool,
    pub self_heal: bool,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub limit: u32,
    pub base_delay_secs: f64,
    pub factor: f64,
    pub max_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            limit: defaults.limit,
            base_delay_secs: defaults.base_delay.as_secs_f64(),
            factor: defaults.factor,
            max_delay_secs: defaults.max_delay.as_secs_f64(),
        }
    }
}

impl RetryConfig {
    fn to_policy(&self) -> Result<RetryPolicy> {
        if self.factor < 1.0 {
            bail!("retry factor must be at least 1.0, got {}", self.factor);
        }
        let base = Duration::try_from_secs_f64(self.base_delay_secs)
            .with_context(|| format!("Invalid base_delay_secs: {}", self.base_delay_secs))?;
        let max = Duration::try_from_secs_f64(self.max_delay_secs)
            .with_context(|| format!("Invalid max_delay_secs: {}", self.max_delay_secs))?;
        Ok(RetryPolicy::new(self.limit, base, self.factor, max))
    }
}

impl SyncwaveConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.validate()?;
        log::debug!(
            "Loaded {} destinations and {} applications from {}",
            config.destinations.len(),
            config.applications.len(),
            path.display()
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut destinations = HashSet::new();
        for destination in &self.destinations {
            if !destinations.insert(destination.name.as_str()) {
                bail!("Duplicate destination '{}'", destination.name);
            }
        }
        let mut applications = HashSet::new();
        for app in &self.applications {
            if !applications.insert(app.name.as_str()) {
                bail!("Duplicate application '{}'", app.name);
            }
            if !destinations.contains(app.destination.name.as_str()) {
                bail!(
                    "Application '{}' targets unknown destination '{}'",
                    app.name,
                    app.destination.name
                );
            }
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let secs = Duration::from_secs;
        ControllerConfig {
            concurrency: self.controller.concurrency,
            operation_processors: self.controller.operation_processors,
            resync_interval: secs(self.controller.resync_interval_secs),
            history_limit: self.controller.history_limit,
            self_heal_cooldown: secs(self.controller.self_heal_cooldown_secs),
            max_inflight_per_destination: self.sync.max_inflight_per_destination,
            observer: ObserverConfig {
                resync_interval: secs(self.observer.resync_interval_secs),
                poll_interval: secs(self.observer.poll_interval_secs),
                staleness_bound: secs(self.observer.staleness_bound_secs),
                event_buffer: self.observer.event_buffer,
            },
            sync: SyncSettings {
                wave_timeout: secs(self.sync.wave_timeout_secs),
                hook_timeout: secs(self.sync.hook_timeout_secs),
                operation_timeout: secs(self.sync.operation_timeout_secs),
                health_poll_interval: Duration::from_millis(self.sync.health_poll_interval_ms),
            },
        }
    }

    /// Application descriptors, with paths expanded and default namespaces filled in
    pub fn applications(&self) -> Result<Vec<Application>> {
        self.applications
            .iter()
            .map(|app| {
                let namespace = app.destination.namespace.clone().or_else(|| {
                    self.destinations
                        .iter()
                        .find(|d| d.name == app.destination.name)
                        .and_then(|d| d.namespace.clone())
                });
                let mut application = Application::new(
                    &app.name,
                    paths::expand(&app.source.path),
                    &app.source.revision,
                    &app.destination.name,
                );
                application.destination.namespace = namespace;
                if app.sync_policy.automated {
                    application =
                        application.with_automated(app.sync_policy.prune, app.sync_policy.self_heal);
                }
                let retry = app
                    .sync_policy
                    .retry
                    .to_policy()
                    .with_context(|| format!("Invalid retry policy for '{}'", app.name))?;
                application = application.with_retry(retry);
                application.ignore_differences = app.ignore_differences.clone();
                Ok(application)
            })
            .collect()
    }

    /// State directory from config, or the platform default
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.controller.state_dir {
            Some(dir) => Ok(paths::expand(dir)),
            None => paths::state_dir(),
        }
    }
}
