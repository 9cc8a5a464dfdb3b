//! Plain-text rendering for the command-line front end.

use crate::controller::cache::SnapshotView;
use crate::model::{ProcessRecord, Reading};

/// Cut `s` to `max_len` chars, the last three being "..." when anything was
/// dropped.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.char_indices().nth(max_len).is_none() {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let end = s.char_indices().nth(keep).map_or(s.len(), |(i, _)| i);
    format!("{}...", &s[..end])
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

pub fn progress_bar(percent: f64, width: usize) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "#".repeat(filled), "-".repeat(empty))
}

fn percent_cell<T>(reading: &Reading<T>, percent: impl Fn(&T) -> f64) -> String {
    match reading.value() {
        Some(v) => {
            let p = percent(v);
            format!("{} {:5.1}%", progress_bar(p, 10), p)
        }
        None => "[   n/a   ]    -  ".to_string(),
    }
}

/// One line per refresh for `watch`.
pub fn summary_line(view: &SnapshotView) -> String {
    let snap = view.snapshot();
    let stale = if view.stale { " (stale)" } else { "" };
    format!(
        "{}  cpu {}  mem {}  disk {}  gen {}{}",
        snap.timestamp.format("%H:%M:%S"),
        percent_cell(&snap.cpu_percent, |c| f64::from(*c)),
        percent_cell(&snap.memory, |m| m.percent),
        percent_cell(&snap.disk, |d| d.percent),
        view.generation(),
        stale,
    )
}

pub fn process_header() -> String {
    format!("{:>7}  {:<24}  {:>7}  {:>10}  {}", "PID", "NAME", "CPU", "MEM", "STATUS")
}

pub fn process_row(p: &ProcessRecord) -> String {
    format!(
        "{:>7}  {:<24}  {:>6.1}%  {:>10}  {}",
        p.pid,
        truncate_str(&p.name, 24),
        p.cpu_percent,
        format_bytes(p.memory_bytes),
        p.status,
    )
}
