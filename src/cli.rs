use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "syncwave")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Continuously reconcile declared manifests with a destination", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/syncwave/config.toml)
    #[arg(short, long, env = "SYNCWAVE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the controller until interrupted
    Run,

    /// Show sync and health status of applications
    Status(StatusArgs),

    /// Show what a sync would change
    Diff(DiffArgs),

    /// Sync an application now
    Sync(SyncArgs),

    /// Show finished sync operations
    History(HistoryArgs),

    /// Re-sync a revision that synced successfully before
    Rollback(RollbackArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct StatusArgs {
    /// Application to show (all when omitted)
    pub app: Option<String>,

    /// Include per-resource status
    #[arg(short, long)]
    pub resources: bool,
}

#[derive(Parser)]
pub struct DiffArgs {
    /// Application to diff
    pub app: String,

    /// Show field-level changes as a unified diff
    #[arg(short, long)]
    pub full: bool,
}

#[derive(Parser)]
pub struct SyncArgs {
    /// Application to sync
    pub app: String,

    /// Revision to sync instead of the configured one
    #[arg(long)]
    pub revision: Option<String>,

    /// Delete live resources that are no longer declared
    #[arg(long)]
    pub prune: bool,

    /// Plan and report without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Only sync these resources: Kind, Kind/name or Kind/namespace/name
    #[arg(long = "resource", value_name = "TARGET")]
    pub resources: Vec<String>,

    /// Skip the prune confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser)]
pub struct HistoryArgs {
    /// Application to show history for
    pub app: String,

    /// Show per-resource failure reasons
    #[arg(short, long)]
    pub reasons: bool,
}

#[derive(Parser)]
pub struct RollbackArgs {
    /// Application to roll back
    pub app: String,

    /// Revision to roll back to
    pub revision: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync() {
        let cli = Cli::parse_from([
            "syncwave",
            "-vv",
            "sync",
            "guestbook",
            "--prune",
            "--resource",
            "Deployment/frontend",
            "--resource",
            "ConfigMap",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Sync(args) => {
                assert_eq!(args.app, "guestbook");
                assert!(args.prune);
                assert!(!args.dry_run);
                assert_eq!(args.resources, vec!["Deployment/frontend", "ConfigMap"]);
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn test_parse_rollback() {
        let cli = Cli::parse_from(["syncwave", "rollback", "guestbook", "v1"]);
        match cli.command {
            Command::Rollback(args) => assert_eq!(args.revision, "v1"),
            _ => panic!("expected rollback"),
        }
    }
}
