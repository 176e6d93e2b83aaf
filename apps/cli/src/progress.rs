//! Progress bar utilities for CLI downloads

use crate::output::{format_eta, format_speed};
use console::style;
use fluxdm_types::{Download, EngineEvent};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Manages progress bars for running downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: Arc<RwLock<HashMap<Uuid, ProgressBar>>>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a progress bar for a download
    pub async fn add_download(&self, download: &Download) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(download.total_size.unwrap_or(0)));
        apply_style(&pb, download.total_size.is_some());

        pb.set_prefix(download.file_name());
        pb.set_position(download.bytes_completed());

        self.bars.write().await.insert(download.id, pb.clone());
        pb
    }

    /// Update a progress bar from an engine event
    pub async fn handle_event(&self, event: &EngineEvent) {
        let bars = self.bars.read().await;
        let Some(pb) = bars.get(&event.download_id()) else {
            return;
        };

        match event {
            EngineEvent::DownloadStarted {
                total_size,
                segments,
                resumed,
                ..
            } => {
                if let Some(total) = total_size {
                    pb.set_length(*total);
                    apply_style(pb, true);
                }
                let verb = if *resumed { "Resuming" } else { "Downloading" };
                pb.set_message(format!("{} over {} connection(s)", verb, segments));
            }

            EngineEvent::ProgressUpdated(snapshot) => {
                if let Some(total) = snapshot.total_bytes {
                    if pb.length() != Some(total) {
                        pb.set_length(total);
                        apply_style(pb, true);
                    }
                }
                pb.set_position(snapshot.bytes_completed);
                pb.set_message(format!(
                    "{} eta {}",
                    format_speed(snapshot.rate),
                    format_eta(snapshot.eta.unwrap_or(0))
                ));
            }

            EngineEvent::SegmentFailed {
                segment_index,
                attempt,
                reason,
                terminal,
                ..
            } => {
                let tag = if *terminal { style("failed").red() } else { style("retrying").yellow() };
                pb.println(format!(
                    "  segment {} {} (attempt {}): {}",
                    segment_index, tag, attempt, reason
                ));
            }

            EngineEvent::DownloadCompleted { .. } => {
                pb.finish_with_message(format!(
                    "{} Download complete",
                    style("✓").green().bold()
                ));
            }

            EngineEvent::DownloadFailed { reasons, .. } => {
                pb.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    reasons.first().map(String::as_str).unwrap_or("unknown error")
                ));
            }

            EngineEvent::DownloadPaused { .. } => {
                pb.abandon_with_message(format!("{} Paused", style("⏸").yellow()));
            }

            EngineEvent::DownloadCancelled { .. } => {
                pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
            }

            EngineEvent::PersistenceDegraded { reason, .. } => {
                pb.println(format!(
                    "  {} progress not saved: {}",
                    style("!").yellow().bold(),
                    reason
                ));
            }
        }
    }

    /// Clear all progress bars
    pub async fn clear(&self) {
        for (_, pb) in self.bars.write().await.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_style(pb: &ProgressBar, known_length: bool) {
    let template = if known_length {
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}"
    } else {
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] {bytes} {msg}"
    };

    if let Ok(style) = ProgressStyle::default_bar().template(template) {
        pb.set_style(style.progress_chars("█▓▒░  "));
    }
}
