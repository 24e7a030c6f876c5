//! Command implementations
//!
//! Every command opens a [`Session`]: the config is loaded, a controller is
//! built over the configured destinations, saved status is restored, and
//! state is written back when the command is done.

pub mod diff;
pub mod history;
pub mod rollback;
pub mod run;
pub mod status;
pub mod sync;

use anyhow::{Context as _, Result};
use reconciler::{Controller, DirectoryDestination, DirectorySource, ResourceRegistry};
use std::path::PathBuf;
use std::sync::Arc;

use crate::Context;
use crate::config::SyncwaveConfig;
use crate::paths;
use crate::state::SyncwaveState;

/// A controller built from config, with persisted state restored
pub struct Session {
    pub controller: Controller,
    state_dir: PathBuf,
}

impl Session {
    pub fn open(ctx: &Context) -> Result<Self> {
        let path = match &ctx.config {
            Some(path) => path.clone(),
            None => paths::config_file()?,
        };
        let config = SyncwaveConfig::load(&path)?;

        let controller = Controller::new(
            ResourceRegistry::builtin(),
            Arc::new(DirectorySource::new()),
            config.controller_config(),
        );
        for destination in &config.destinations {
            let root = destination.root();
            log::debug!("Destination {} at {}", destination.name, root.display());
            controller.add_destination(Arc::new(
                DirectoryDestination::new(&destination.name, root).with_settle(destination.settle),
            ));
        }
        for app in config.applications()? {
            let name = app.name.clone();
            controller
                .register(app)
                .with_context(|| format!("Failed to register {name}"))?;
        }

        let state_dir = config.state_dir()?;
        SyncwaveState::load(&state_dir)?.restore(&controller)?;

        Ok(Self {
            controller,
            state_dir,
        })
    }

    /// Read live state from every destination
    pub async fn refresh(&self) -> Result<()> {
        self.controller
            .refresh_destinations()
            .await
            .context("Failed to read live state")
    }

    /// Fail early with a friendly message for unknown names
    pub fn require(&self, app: &str) -> Result<()> {
        if self.controller.applications().iter().any(|a| a == app) {
            Ok(())
        } else {
            anyhow::bail!("Unknown application '{app}'")
        }
    }

    pub fn save(&self) -> Result<()> {
        SyncwaveState::capture(&self.controller).save(&self.state_dir)
    }
}
