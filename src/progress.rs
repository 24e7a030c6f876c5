//! Progress indicators for syncwave CLI

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reconciler::{ResultStatus, SyncOperation};
use std::time::Duration;

/// Bar over the resource results of a running operation
pub fn operation_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Reflect the latest operation snapshot on a bar
pub fn update_operation(pb: &ProgressBar, op: &SyncOperation) {
    let done = op
        .results
        .iter()
        .filter(|r| r.status != ResultStatus::Pending)
        .count();
    pb.set_length(op.results.len() as u64);
    pb.set_position(done as u64);
    let wave = op
        .current_wave
        .map_or_else(|| "-".to_string(), |w| w.to_string());
    pb.set_message(format!("{:?}, wave {wave}", op.phase));
}

pub fn finish_success(pb: &ProgressBar, msg: &str) {
    pb.finish_and_clear();
    println!("{} {}", "✓".green(), msg);
}

pub fn finish_error(pb: &ProgressBar, msg: &str) {
    pb.finish_and_clear();
    eprintln!("{} {}", "✗".red(), msg);
}
