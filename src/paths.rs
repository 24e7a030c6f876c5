//! Centralized path resolution for syncwave
//!
//! # Environment Variables
//!
//! - `SYNCWAVE_CONFIG` - Config file (read by the CLI, see `--config`)
//! - `SYNCWAVE_STATE_DIR` - Override state directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `XDG_CONFIG_HOME/syncwave` (if set)
//! 2. Platform default:
//!    - Windows: `%APPDATA%\syncwave`
//!    - macOS/Linux: `~/.config/syncwave`
//!
//! For state_dir():
//! 1. `SYNCWAVE_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/syncwave` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\syncwave`
//!    - macOS/Linux: `~/.local/state/syncwave`

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "SYNCWAVE_STATE_DIR";

const APP_DIR: &str = "syncwave";

/// Get the syncwave config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join(APP_DIR);
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join(APP_DIR));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join(APP_DIR))
}

/// Default config file, `<config_dir>/config.toml`
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Get the syncwave state directory path
///
/// Priority:
/// 1. `SYNCWAVE_STATE_DIR` env var
/// 2. `XDG_STATE_HOME/syncwave`
/// 3. Platform default
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join(APP_DIR);
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            return Ok(local_app_data.join(APP_DIR));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".local").join("state").join(APP_DIR))
}

/// Expand ~ and environment variables in a path string
///
/// Unknown variables are left as they are.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
