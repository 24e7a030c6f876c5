use anyhow::{Result, bail};
use colored::Colorize;
use dialoguer::Confirm;
use reconciler::{Decision, DiffAction, OperationPhase, ResultStatus, SyncOperation, SyncRequest};
use std::time::Duration;

use super::Session;
use crate::Context;
use crate::cli::SyncArgs;
use crate::progress;
use crate::ui;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

pub async fn run(ctx: &Context, args: SyncArgs) -> Result<()> {
    let session = Session::open(ctx)?;
    session.require(&args.app)?;
    session.refresh().await?;

    if args.prune && !args.dry_run && !args.yes && !confirm_prune(&session, &args.app).await? {
        ui::info("Cancelled");
        return Ok(());
    }

    let request = SyncRequest {
        revision: args.revision,
        prune: args.prune,
        dry_run: args.dry_run,
        resources: args.resources,
    };
    let decision = session.controller.sync(&args.app, request).await?;
    let result = follow(ctx, &session, &args.app, &decision).await;
    session.save()?;
    result
}

/// List what a prune would delete and ask before going on
async fn confirm_prune(session: &Session, app: &str) -> Result<bool> {
    let report = session.controller.diff(app).await?;
    let doomed: Vec<_> = report
        .resources
        .iter()
        .filter(|r| r.diff.action == DiffAction::Prune)
        .collect();
    if doomed.is_empty() {
        return Ok(true);
    }

    ui::warn(&format!("{} resource(s) will be deleted:", doomed.len()));
    for resource in &doomed {
        println!("  {} {}", "-".red(), resource.key);
    }
    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(false)
        .interact()?;
    Ok(confirmed)
}

/// Wait for the operation a decision started, showing progress
///
/// Ctrl-C aborts the operation. Fails if the operation did not succeed.
pub async fn follow(ctx: &Context, session: &Session, app: &str, decision: &Decision) -> Result<()> {
    match decision {
        Decision::AlreadySyncing => bail!("{app} already has an operation in progress"),
        Decision::NoAction => {
            ui::info("Nothing to do");
            return Ok(());
        }
        Decision::StartSync { revision, trigger } => {
            if !ctx.quiet {
                ui::info(&format!("Started {trigger} sync of {app} at {revision}"));
            }
        }
    }

    let controller = &session.controller;
    let pb = (!ctx.quiet).then(|| progress::operation_bar(0));
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let wait = controller.wait_for_operation(app);
    tokio::pin!(wait);
    let mut aborted = false;

    let op = loop {
        tokio::select! {
            op = &mut wait => break op?,
            _ = ticker.tick() => {
                if let (Some(pb), Some(op)) = (&pb, controller.status(app)?.operation) {
                    progress::update_operation(pb, &op);
                }
            }
            result = tokio::signal::ctrl_c(), if !aborted => {
                result?;
                aborted = true;
                controller.abort(app)?;
                if let Some(pb) = &pb {
                    pb.set_message("aborting");
                }
            }
        }
    };
    let Some(op) = op else {
        bail!("{app} has no operation");
    };

    let summary = format!(
        "#{} {} {}",
        op.id,
        ui::phase(op.phase),
        op.message.as_deref().unwrap_or_default()
    );
    match (&pb, op.phase) {
        (Some(pb), OperationPhase::Succeeded) => progress::finish_success(pb, &summary),
        (Some(pb), _) => progress::finish_error(pb, &summary),
        (None, _) => {}
    }
    if !ctx.quiet {
        show_results(&op);
    }

    if op.phase == OperationPhase::Succeeded {
        Ok(())
    } else {
        bail!(
            "Sync of {app} ended {:?}: {}",
            op.phase,
            op.message.unwrap_or_default()
        )
    }
}

fn show_results(op: &SyncOperation) {
    for result in &op.results {
        let status = match result.status {
            ResultStatus::Healthy | ResultStatus::Completed | ResultStatus::Applied => {
                result.status.to_string().green()
            }
            ResultStatus::Pruned => result.status.to_string().red(),
            ResultStatus::Failed => result.status.to_string().red().bold(),
            ResultStatus::Pending | ResultStatus::Skipped | ResultStatus::PruneSkipped => {
                result.status.to_string().dimmed()
            }
        };
        let retries = if result.attempts > 1 {
            format!(" ({} attempts)", result.attempts)
        } else {
            String::new()
        };
        println!(
            "  {:>3}  {:<50} {}{}",
            result.wave,
            result.key.to_string(),
            status,
            retries.dimmed()
        );
        if let Some(message) = &result.message {
            ui::dim(&format!("       {message}"));
        }
    }
}
