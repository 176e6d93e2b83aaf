//! Shared types for FluxDM
//!
//! This crate contains the data model shared by the engine, its persistence
//! gateways and the front-ends (CLI, and anything else consuming events).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque identity of a download
pub type DownloadId = Uuid;

/// Sentinel `end` value for a segment whose length is not known yet
pub const UNKNOWN_END: u64 = u64::MAX;

/// Current on-disk format of [`ResumeToken`]
pub const RESUME_TOKEN_VERSION: u32 = 1;

// ============================================================================
// Download Types
// ============================================================================

/// A single download owned by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub id: DownloadId,
    pub url: String,
    pub destination: PathBuf,
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
    pub state: DownloadState,
    pub segments: Vec<Segment>,
    pub options: TransferOptions,
    /// Last segment failure reasons, kept for diagnostics once Failed
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Download {
    pub fn new(url: String, destination: PathBuf, options: TransferOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            destination,
            total_size: None,
            supports_ranges: false,
            state: DownloadState::Queued,
            segments: Vec::new(),
            options,
            failure_reasons: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Sum of the bytes written by every segment
    pub fn bytes_completed(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_written).sum()
    }

    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(size) if size > 0 => (self.bytes_completed() as f64 / size as f64) * 100.0,
            Some(_) if self.state == DownloadState::Completed => 100.0,
            _ => 0.0,
        }
    }

    /// Whether every segment reports Done (vacuously true for empty resources)
    pub fn all_segments_done(&self) -> bool {
        self.segments.iter().all(|s| s.state == SegmentState::Done)
    }

    /// File name component of the destination, for display
    pub fn file_name(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string())
    }
}

/// Lifecycle state of a download
///
/// `Queued → Probing → Planning → Running → {Paused, Completed, Failed, Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Probing,
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    /// Completed, Failed and Cancelled never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }

    /// Whether a coordinator may move a download from `self` to `next`
    pub fn can_transition_to(self, next: DownloadState) -> bool {
        use DownloadState::*;
        match (self, next) {
            (Queued, Probing | Planning | Paused | Cancelled) => true,
            (Probing, Planning | Paused | Failed | Cancelled) => true,
            (Planning, Running | Paused | Failed | Cancelled) => true,
            (Running, Paused | Completed | Failed | Cancelled) => true,
            (Paused, Probing | Planning | Running | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadState::Queued => "queued",
            DownloadState::Probing => "probing",
            DownloadState::Planning => "planning",
            DownloadState::Running => "running",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DownloadState::Queued),
            "probing" => Ok(DownloadState::Probing),
            "planning" => Ok(DownloadState::Planning),
            "running" => Ok(DownloadState::Running),
            "paused" => Ok(DownloadState::Paused),
            "completed" => Ok(DownloadState::Completed),
            "failed" => Ok(DownloadState::Failed),
            "cancelled" => Ok(DownloadState::Cancelled),
            other => Err(format!("unknown download state: {}", other)),
        }
    }
}

/// A contiguous byte range of the resource, fetched independently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: u32,
    /// First byte (inclusive)
    pub start: u64,
    /// Last byte (inclusive), [`UNKNOWN_END`] while the length is unknown
    pub end: u64,
    pub bytes_written: u64,
    pub state: SegmentState,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Segment {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            bytes_written: 0,
            state: SegmentState::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Get the total size of this segment in bytes
    /// Returns u64::MAX for unknown size segments (where end = u64::MAX)
    pub fn size(&self) -> u64 {
        if self.is_unknown_size() {
            u64::MAX
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_unknown_size(&self) -> bool {
        self.end == UNKNOWN_END
    }

    /// Bytes still to fetch; u64::MAX when the length is unknown
    pub fn remaining(&self) -> u64 {
        if self.is_unknown_size() {
            u64::MAX
        } else {
            self.size().saturating_sub(self.bytes_written)
        }
    }

    /// Absolute offset the next request must start from
    pub fn resume_offset(&self) -> u64 {
        self.start + self.bytes_written
    }

    pub fn progress(&self) -> f64 {
        if self.is_unknown_size() {
            0.0
        } else {
            (self.bytes_written as f64 / self.size() as f64) * 100.0
        }
    }
}

/// Per-segment lifecycle, only ever moving forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SegmentState::Pending => "pending",
            SegmentState::InFlight => "in_flight",
            SegmentState::Done => "done",
            SegmentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SegmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SegmentState::Pending),
            "in_flight" => Ok(SegmentState::InFlight),
            "done" => Ok(SegmentState::Done),
            "failed" => Ok(SegmentState::Failed),
            other => Err(format!("unknown segment state: {}", other)),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Per-download overrides supplied by the caller at `add`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Per-download parallelism cap
    pub max_connections: Option<u32>,
    /// Minimum segment granularity in bytes
    pub chunk_size: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub retry_attempts: Option<u32>,
    /// Per-download ceiling in bytes per second
    pub speed_limit: Option<u64>,
}

/// Options after defaults from [`EngineConfig`] have been applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    pub max_connections: u32,
    pub chunk_size: u64,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub speed_limit: Option<u64>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        EngineConfig::default().resolve(&DownloadOptions::default())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_connections: u32,
    pub chunk_size: u64,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    /// First retry delay
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    /// Upper bound for any single retry delay
    pub backoff_max_ms: u64,
    /// How often a running download saves its resume token
    pub checkpoint_interval_secs: u64,
    /// Minimum spacing between two ProgressUpdated events of one download
    pub progress_interval_ms: u64,
    /// Token bucket refill period of the rate governor
    pub refill_interval_ms: u64,
    /// Ceiling across all downloads, in bytes per second
    pub global_speed_limit: Option<u64>,
    pub delete_partial_on_cancel: bool,
    /// Confirm size / range support with `Range: bytes=0-0` when HEAD is not conclusive
    pub probe_with_range_request: bool,
    /// Per-subscriber event queue length before progress events are shed
    pub event_queue_capacity: usize,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            chunk_size: 1024 * 1024,
            timeout_seconds: 30,
            retry_attempts: 5,
            backoff_base_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 60_000,
            checkpoint_interval_secs: 5,
            progress_interval_ms: 250,
            refill_interval_ms: 100,
            global_speed_limit: None,
            delete_partial_on_cancel: false,
            probe_with_range_request: true,
            event_queue_capacity: 256,
            user_agent: concat!("FluxDM/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Fill the caller's options with this config's defaults
    pub fn resolve(&self, options: &DownloadOptions) -> TransferOptions {
        TransferOptions {
            max_connections: options.max_connections.unwrap_or(self.max_connections),
            chunk_size: options.chunk_size.unwrap_or(self.chunk_size),
            timeout_seconds: options.timeout_seconds.unwrap_or(self.timeout_seconds),
            retry_attempts: options.retry_attempts.unwrap_or(self.retry_attempts),
            speed_limit: options.speed_limit.filter(|l| *l > 0),
        }
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Immutable point-in-time progress readout for a download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub id: DownloadId,
    pub state: DownloadState,
    pub bytes_completed: u64,
    pub total_bytes: Option<u64>,
    /// Smoothed transfer rate in bytes per second
    pub rate: u64,
    /// Seconds remaining at the current rate
    pub eta: Option<u64>,
    pub segments: Vec<SegmentProgress>,
}

impl ProgressSnapshot {
    pub fn from_download(download: &Download, rate: u64) -> Self {
        let bytes_completed = download.bytes_completed();
        let eta = match download.total_size {
            Some(total) if rate > 0 => Some(total.saturating_sub(bytes_completed) / rate),
            _ => None,
        };

        Self {
            id: download.id,
            state: download.state,
            bytes_completed,
            total_bytes: download.total_size,
            rate,
            eta,
            segments: download.segments.iter().map(SegmentProgress::from).collect(),
        }
    }

    pub fn progress(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.bytes_completed as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Per-segment line of a [`ProgressSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentProgress {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub bytes_written: u64,
    pub state: SegmentState,
    pub retry_count: u32,
}

impl From<&Segment> for SegmentProgress {
    fn from(segment: &Segment) -> Self {
        Self {
            index: segment.index,
            start: segment.start,
            end: segment.end,
            bytes_written: segment.bytes_written,
            state: segment.state,
            retry_count: segment.retry_count,
        }
    }
}

// ============================================================================
// Resume Token
// ============================================================================

/// Durable snapshot of a download, sufficient to reconstruct and continue it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub version: u32,
    pub id: DownloadId,
    pub url: String,
    pub destination: PathBuf,
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
    pub state: DownloadState,
    pub options: TransferOptions,
    #[serde(default)]
    pub failure_reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub segments: Vec<Segment>,
}

impl ResumeToken {
    pub fn from_download(download: &Download) -> Self {
        Self {
            version: RESUME_TOKEN_VERSION,
            id: download.id,
            url: download.url.clone(),
            destination: download.destination.clone(),
            total_size: download.total_size,
            supports_ranges: download.supports_ranges,
            state: download.state,
            options: download.options,
            failure_reasons: download.failure_reasons.clone(),
            created_at: download.created_at,
            completed_at: download.completed_at,
            segments: download.segments.clone(),
        }
    }

    /// Rebuild the download exactly as it was saved
    pub fn into_download(self) -> Download {
        Download {
            id: self.id,
            url: self.url,
            destination: self.destination,
            total_size: self.total_size,
            supports_ranges: self.supports_ranges,
            state: self.state,
            segments: self.segments,
            options: self.options,
            failure_reasons: self.failure_reasons,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events published by the engine to its subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    DownloadStarted {
        id: DownloadId,
        url: String,
        total_size: Option<u64>,
        segments: u32,
        resumed: bool,
    },
    ProgressUpdated(ProgressSnapshot),
    SegmentFailed {
        id: DownloadId,
        segment_index: u32,
        attempt: u32,
        reason: String,
        terminal: bool,
    },
    DownloadCompleted {
        id: DownloadId,
        total_bytes: u64,
    },
    DownloadFailed {
        id: DownloadId,
        reasons: Vec<String>,
    },
    DownloadPaused {
        id: DownloadId,
        bytes_completed: u64,
    },
    DownloadCancelled {
        id: DownloadId,
        partial_deleted: bool,
    },
    /// A resume token could not be saved; the download keeps running in memory
    PersistenceDegraded {
        id: DownloadId,
        reason: String,
    },
}

impl EngineEvent {
    pub fn download_id(&self) -> DownloadId {
        match self {
            EngineEvent::DownloadStarted { id, .. }
            | EngineEvent::SegmentFailed { id, .. }
            | EngineEvent::DownloadCompleted { id, .. }
            | EngineEvent::DownloadFailed { id, .. }
            | EngineEvent::DownloadPaused { id, .. }
            | EngineEvent::DownloadCancelled { id, .. }
            | EngineEvent::PersistenceDegraded { id, .. } => *id,
            EngineEvent::ProgressUpdated(snapshot) => snapshot.id,
        }
    }

    /// Only intermediate progress may be shed for slow subscribers
    pub fn is_droppable(&self) -> bool {
        matches!(self, EngineEvent::ProgressUpdated(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::DownloadCompleted { .. }
                | EngineEvent::DownloadFailed { .. }
                | EngineEvent::DownloadCancelled { .. }
        )
    }
}
