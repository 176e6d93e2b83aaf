//! Output formatting utilities

use console::{style, StyledObject};
use fluxdm_types::DownloadState;
use serde::Serialize;

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format an optional size, `?` when unknown
pub fn format_size(bytes: Option<u64>) -> String {
    bytes.map(format_bytes).unwrap_or_else(|| "?".to_string())
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

pub fn state_icon(state: DownloadState) -> StyledObject<&'static str> {
    match state {
        DownloadState::Completed => style("✓").green(),
        DownloadState::Running | DownloadState::Probing | DownloadState::Planning => {
            style("↓").cyan()
        }
        DownloadState::Paused => style("⏸").yellow(),
        DownloadState::Failed => style("✗").red(),
        DownloadState::Cancelled => style("○").dim(),
        DownloadState::Queued => style("·").dim(),
    }
}

/// Shorten to `max` characters for table cells
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let kept: String = value.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        value.to_string()
    }
}
