use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use reconciler::{ApplicationStatus, DiffAction, DiffStatus};

use super::Session;
use crate::Context;
use crate::cli::StatusArgs;
use crate::ui;

pub async fn run(ctx: &Context, args: StatusArgs) -> Result<()> {
    let session = Session::open(ctx)?;
    let apps = match &args.app {
        Some(app) => {
            session.require(app)?;
            vec![app.clone()]
        }
        None => session.controller.applications(),
    };
    if apps.is_empty() {
        ui::info("No applications configured");
        return Ok(());
    }

    session.refresh().await?;
    for app in &apps {
        // Render failures are recorded as a condition and shown below
        if let Err(e) = session.controller.diff(app).await {
            log::debug!("Comparing {app} failed: {e}");
        }
        let status = session.controller.status(app)?;
        let spec = session.controller.application(app)?;
        show_status(app, &spec.source.revision, &status, args.resources);
    }
    println!();

    session.save()
}

fn show_status(app: &str, target: &str, status: &ApplicationStatus, resources: bool) {
    let now = Utc::now();
    ui::header(app);
    ui::kv("Sync", &ui::sync_status(status.sync).to_string());
    ui::kv("Health", &ui::health_status(status.health).to_string());

    let observed = status.observed.as_ref().map_or_else(
        || target.to_string(),
        |m| format!("{} ({})", m.revision, ui::short_digest(&m.digest)),
    );
    ui::kv("Target", &observed);
    if let Some(synced) = &status.last_synced {
        ui::kv(
            "Synced",
            &format!("{} ({})", synced.revision, ui::short_digest(&synced.digest)),
        );
    }

    if let Some(op) = &status.operation {
        let when = op
            .finished_at
            .map_or_else(|| "running".to_string(), |at| ui::format_age(at, now));
        let message = op.message.as_deref().unwrap_or_default();
        ui::kv(
            "Operation",
            &format!("#{} {} {} {}", op.id, op.trigger, ui::phase(op.phase), when.dimmed()),
        );
        if !message.is_empty() {
            ui::dim(message);
        }
    }

    for condition in &status.conditions {
        ui::warn(&format!("{:?}: {}", condition.kind, condition.message));
    }

    if resources {
        ui::section("Resources");
        for resource in &status.resources {
            let sync = match resource.sync {
                DiffStatus::InSync => "InSync".green(),
                DiffStatus::OutOfSync => "OutOfSync".yellow(),
                DiffStatus::Unknown => "Unknown".dimmed(),
            };
            let action = match resource.action {
                DiffAction::None => String::new(),
                other => format!(" ({other:?})"),
            };
            let health = resource
                .health
                .as_ref()
                .map(|h| ui::health_status(h.status).to_string())
                .unwrap_or_default();
            println!(
                "  {:>3}  {:<50} {}{} {}",
                resource.wave,
                resource.key.to_string(),
                sync,
                action,
                health
            );
        }
    } else {
        let drifted = status.drifted().count();
        if drifted > 0 {
            ui::kv(
                "Drift",
                &format!("{drifted} of {} resources out of sync", status.resources.len()),
            );
        }
    }
}
