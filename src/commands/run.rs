//! Long-running controller
//!
//! Prints status events as they happen and persists state after every
//! finished operation and on a fixed cadence. Ctrl-C aborts running
//! operations, waits for them to wind down and exits.

use anyhow::Result;
use colored::Colorize;
use reconciler::{Event, EventKind};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use super::Session;
use crate::Context;
use crate::ui;

const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(ctx: &Context) -> Result<()> {
    let session = Session::open(ctx)?;
    let controller = session.controller.clone();
    let mut events = controller.subscribe();
    controller.start();

    if !ctx.quiet {
        ui::success(&format!(
            "Watching {} application(s), Ctrl-C to stop",
            controller.applications().len()
        ));
    }

    let mut persist = tokio::time::interval(PERSIST_INTERVAL);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !ctx.quiet {
                        print_event(&event);
                    }
                    // Persist once history holds the operation
                    if event.kind == EventKind::OperationRecorded {
                        persist_state(&session);
                    }
                }
                Err(RecvError::Lagged(missed)) => log::warn!("Missed {missed} status events"),
                Err(RecvError::Closed) => break,
            },
            _ = persist.tick() => persist_state(&session),
        }
    }

    for app in controller.applications() {
        if controller.abort(&app)? && !ctx.quiet {
            ui::warn(&format!("Aborting running operation on {app}"));
        }
    }
    controller.shutdown().await;
    session.save()?;
    if !ctx.quiet {
        ui::success("Stopped");
    }
    Ok(())
}

/// Write state, logging failures; the next tick tries again
fn persist_state(session: &Session) {
    if let Err(e) = session.save() {
        log::warn!("Failed to persist state: {e:#}");
    }
}

fn print_event(event: &Event) {
    let time = event.at.format("%H:%M:%S").to_string();
    let kind = event.kind.to_string();
    let kind = if event.kind.is_warning() {
        kind.yellow()
    } else {
        match event.kind {
            EventKind::OperationFinished | EventKind::ResourceApplied | EventKind::ResourcePruned => {
                kind.green()
            }
            _ => kind.cyan(),
        }
    };
    println!(
        "{} {} {} {}",
        time.dimmed(),
        event.app.bold(),
        kind,
        event.message
    );
}
