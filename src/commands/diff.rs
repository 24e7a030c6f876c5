use anyhow::Result;
use colored::Colorize;
use reconciler::diff::normalize;
use reconciler::{DiffAction, Freshness, IgnoreRule, ManagedResource};
use serde_json::Value;

use super::Session;
use crate::Context;
use crate::cli::DiffArgs;
use crate::ui;

pub async fn run(ctx: &Context, args: DiffArgs) -> Result<()> {
    let session = Session::open(ctx)?;
    session.require(&args.app)?;
    session.refresh().await?;

    let app = session.controller.application(&args.app)?;
    let report = session.controller.diff(&args.app).await?;
    let summary = report.summary();

    ui::header(&format!(
        "{} @ {} ({})",
        args.app,
        report.revision,
        ui::short_digest(&report.digest)
    ));
    if report.freshness != Freshness::Fresh {
        ui::warn(&format!(
            "Live state is {:?}; differences cannot be trusted",
            report.freshness
        ));
    }

    if !summary.has_changes() {
        ui::success(&format!("{} resources in sync", summary.in_sync));
        return session.save();
    }

    for resource in report
        .resources
        .iter()
        .filter(|r| r.diff.is_out_of_sync())
    {
        show_resource(resource, &app.ignore_differences, args.full);
    }

    println!();
    println!(
        "  {} to create, {} to update, {} to prune, {} in sync",
        summary.creates.to_string().green(),
        summary.updates.to_string().yellow(),
        summary.prunes.to_string().red(),
        summary.in_sync.to_string().dimmed()
    );
    if summary.foreign > 0 {
        ui::warn(&format!(
            "{} resource(s) were changed outside syncwave",
            summary.foreign
        ));
    }

    session.save()
}

fn show_resource(resource: &ManagedResource, ignore: &[IgnoreRule], full: bool) {
    let (symbol, label) = match resource.diff.action {
        DiffAction::Create => ("+".green(), "create".green()),
        DiffAction::Update => ("~".yellow(), "update".yellow()),
        DiffAction::Prune => ("-".red(), "prune".red()),
        DiffAction::None => (" ".normal(), "unknown".dimmed()),
    };
    let hook = resource
        .hook
        .map(|h| format!(" [{h}]"))
        .unwrap_or_default();
    println!(
        "{symbol} {} {}{}",
        resource.key,
        label,
        hook.dimmed()
    );

    if full {
        show_text_diff(resource, ignore);
    } else {
        for path in resource.diff.paths() {
            ui::dim(&path);
        }
    }
}

/// Unified diff of the normalized live and desired manifests
fn show_text_diff(resource: &ManagedResource, ignore: &[IgnoreRule]) {
    let render = |value: Option<&Value>| {
        value
            .map(|v| normalize(v, &resource.key, ignore))
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .map(|s| s + "\n")
            .unwrap_or_default()
    };
    let live = render(resource.live.as_ref());
    let desired = render(resource.desired.as_ref());

    let diff = similar::TextDiff::from_lines(&live, &desired);
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Delete => print!("    {}", format!("- {change}").red()),
            similar::ChangeTag::Insert => print!("    {}", format!("+ {change}").green()),
            similar::ChangeTag::Equal => {}
        }
    }
}
