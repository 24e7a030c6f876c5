use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use reconciler::{HealthStatus, OperationPhase, SyncStatus};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Status Coloring
// ============================================================================

pub fn sync_status(status: SyncStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        SyncStatus::Synced => text.green(),
        SyncStatus::OutOfSync => text.yellow(),
        SyncStatus::Unknown => text.dimmed(),
    }
}

pub fn health_status(status: HealthStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        HealthStatus::Healthy => text.green(),
        HealthStatus::Progressing => text.cyan(),
        HealthStatus::Suspended => text.blue(),
        HealthStatus::Missing | HealthStatus::Unknown => text.dimmed(),
        HealthStatus::Degraded => text.red(),
    }
}

pub fn phase(phase: OperationPhase) -> ColoredString {
    let text = format!("{phase:?}");
    match phase {
        OperationPhase::Succeeded => text.green(),
        OperationPhase::Running | OperationPhase::Pending => text.cyan(),
        OperationPhase::Terminating => text.yellow(),
        OperationPhase::Failed | OperationPhase::Error => text.red(),
    }
}

// ============================================================================
// Time Formatting
// ============================================================================

/// Human-readable age of a timestamp relative to `now`, e.g. "5m ago"
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(at).num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86_400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// Shorten a digest for display
pub fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
