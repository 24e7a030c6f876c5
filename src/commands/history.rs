use anyhow::Result;
use chrono::Utc;
use colored::Colorize;

use super::Session;
use crate::Context;
use crate::cli::HistoryArgs;
use crate::ui;

pub fn run(ctx: &Context, args: HistoryArgs) -> Result<()> {
    let session = Session::open(ctx)?;
    session.require(&args.app)?;

    let entries = session.controller.history(&args.app)?;
    if entries.is_empty() {
        ui::info(&format!("No finished operations for {}", args.app));
        return Ok(());
    }

    let now = Utc::now();
    ui::header(&format!("{} history", args.app));
    for entry in &entries {
        let took = entry
            .finished_at
            .map(|end| end.signed_duration_since(entry.started_at).num_seconds())
            .map(|secs| format!("{secs}s"))
            .unwrap_or_default();
        println!(
            "  {:>4}  {:<12} {:<10} {:<20} {:>8} {}",
            format!("#{}", entry.id),
            entry.revision,
            entry.trigger.to_string(),
            ui::phase(entry.phase).to_string(),
            took.dimmed(),
            ui::format_age(entry.started_at, now).dimmed()
        );
        if let Some(message) = &entry.message {
            ui::dim(&format!("      {message}"));
        }
        if args.reasons {
            for reason in &entry.reasons {
                ui::dim(&format!("        {reason}"));
            }
        }
    }
    println!();
    Ok(())
}
