//! Download task - coordinates the segment workers of one download
//!
//! The task owns its [`Download`] for the length of a run. It probes, plans,
//! spawns one worker per eligible segment, folds worker reports into the
//! segment list and decides retries. Control commands arrive over a channel;
//! the final state is handed back through [`TaskHandle::wait`].

use crate::engine::file::DestinationFile;
use crate::engine::persistence::PersistenceGateway;
use crate::engine::planner::plan_segments;
use crate::engine::prober::RangeProber;
use crate::engine::progress::SpeedMeter;
use crate::engine::rate_limiter::{RateGovernor, RateLimiter};
use crate::engine::retry::{RetryPolicy, RetrySchedule};
use crate::engine::segment_worker::{SegmentWorker, WorkerContext, WorkerEvent, WorkerReport};
use crate::engine::transport::Transport;
use crate::error::{FluxError, SegmentError};
use crate::events::EventBus;
use chrono::Utc;
use fluxdm_types::{
    Download, DownloadId, DownloadState, EngineConfig, EngineEvent, ProgressSnapshot,
    ResumeToken, SegmentState,
};
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Control messages from the manager to a running task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCommand {
    Pause,
    Cancel { delete_partial: bool },
    SetSpeedLimit(Option<u64>),
}

/// Engine-wide collaborators shared by every task
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<EngineConfig>,
    pub transport: Arc<dyn Transport>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub events: EventBus,
    pub global_limiter: RateLimiter,
    /// Cancelled when the engine shuts down
    pub root: CancellationToken,
}

/// Manager-side handle to a running task
#[derive(Clone)]
pub struct TaskHandle {
    id: DownloadId,
    commands: mpsc::UnboundedSender<TaskCommand>,
    snapshot: Arc<RwLock<ProgressSnapshot>>,
    finished: watch::Receiver<Option<Download>>,
}

impl TaskHandle {
    pub fn id(&self) -> DownloadId {
        self.id
    }

    /// Returns false once the task has exited
    pub fn send(&self, command: TaskCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot.read().clone()
    }

    /// The final download, once the task has exited
    pub fn finished(&self) -> Option<Download> {
        self.finished.borrow().clone()
    }

    /// Wait for the task to exit and return its final download
    pub async fn wait(&self) -> Result<Download, FluxError> {
        let mut finished = self.finished.clone();
        let download = finished
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                FluxError::InvalidOperation(format!("download task {} aborted", self.id))
            })?
            .clone();
        download.ok_or_else(|| {
            FluxError::InvalidOperation(format!("download task {} aborted", self.id))
        })
    }
}

/// Spawn the coordinator for `download` on the current runtime
pub fn spawn_task(download: Download, ctx: TaskContext, resumed: bool) -> TaskHandle {
    let id = download.id;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (finished_tx, finished_rx) = watch::channel(None);
    let snapshot = Arc::new(RwLock::new(ProgressSnapshot::from_download(&download, 0)));

    let task = DownloadTask::new(download, ctx, resumed, commands_rx, snapshot.clone());
    tokio::spawn(async move {
        let download = task.run().await;
        finished_tx.send_replace(Some(download));
    });

    TaskHandle {
        id,
        commands: commands_tx,
        snapshot,
        finished: finished_rx,
    }
}

/// Why the worker loop stopped before the download finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Pause,
    Cancel { delete_partial: bool },
}

/// A download task that manages multiple segment workers
pub struct DownloadTask {
    download: Download,
    ctx: TaskContext,
    resumed: bool,
    commands: mpsc::UnboundedReceiver<TaskCommand>,
    snapshot: Arc<RwLock<ProgressSnapshot>>,
    cancel: CancellationToken,
    limiter: RateLimiter,
    policy: RetryPolicy,
    retries: RetrySchedule,
    meter: SpeedMeter,
    /// URL after redirects, used for segment requests
    source_url: String,
    progress_dirty: bool,
}

impl DownloadTask {
    fn new(
        download: Download,
        ctx: TaskContext,
        resumed: bool,
        commands: mpsc::UnboundedReceiver<TaskCommand>,
        snapshot: Arc<RwLock<ProgressSnapshot>>,
    ) -> Self {
        let interval = Duration::from_millis(ctx.config.refill_interval_ms);
        let limiter = RateLimiter::new(download.options.speed_limit, interval);
        let policy = RetryPolicy::new(&ctx.config, download.options.retry_attempts);
        let cancel = ctx.root.child_token();
        let meter = SpeedMeter::new(download.bytes_completed());
        let source_url = download.url.clone();

        Self {
            download,
            ctx,
            resumed,
            commands,
            snapshot,
            cancel,
            limiter,
            policy,
            retries: RetrySchedule::new(),
            meter,
            source_url,
            progress_dirty: false,
        }
    }

    /// Run the download task until it pauses or reaches a terminal state
    pub async fn run(mut self) -> Download {
        info!(
            "Starting download task for {} ({}), resumed={}",
            self.download.id, self.download.url, self.resumed
        );

        if let Err(interrupt) = self.prepare().await {
            self.interrupt(interrupt, None).await;
            return self.download;
        }
        if self.download.state.is_terminal() {
            return self.download;
        }

        let file = match self.open_file().await {
            Ok(file) => file,
            Err(e) => {
                self.fail(vec![format!("cannot open destination: {}", e)]).await;
                return self.download;
            }
        };

        self.transition(DownloadState::Running);
        self.ctx.events.publish(EngineEvent::DownloadStarted {
            id: self.download.id,
            url: self.download.url.clone(),
            total_size: self.download.total_size,
            segments: self.download.segments.len() as u32,
            resumed: self.resumed,
        });
        self.checkpoint().await;

        match self.transfer(&file).await {
            Ok(()) => self.complete(&file).await,
            Err(None) => {
                let reasons = self.failure_reasons();
                self.fail(reasons).await;
            }
            Err(Some(interrupt)) => self.interrupt(interrupt, Some(&file)).await,
        }

        self.download
    }

    // ========================================================================
    // Probing / planning
    // ========================================================================

    /// Probe if needed and plan segments. Leaves the download Failed on a
    /// probe error; returns Err when a command interrupted the probe.
    async fn prepare(&mut self) -> Result<(), Interrupt> {
        let needs_probe = self.download.segments.is_empty() || self.download.total_size.is_none();

        if needs_probe {
            self.transition(DownloadState::Probing);
            let prober = RangeProber::new(
                self.ctx.transport.clone(),
                Duration::from_secs(self.download.options.timeout_seconds),
                self.ctx.config.probe_with_range_request,
            );
            let url = self.download.url.clone();

            let result = tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if let Some(interrupt) = self.apply_command(command).await {
                        return Err(interrupt);
                    }
                    // A speed change while probing; probe again from scratch
                    prober.probe(&url).await
                }
                _ = self.cancel.cancelled() => return Err(Interrupt::Pause),
                result = prober.probe(&url) => result,
            };

            match result {
                Ok(probe) => {
                    self.source_url = probe.final_url.clone();
                    self.download.supports_ranges = probe.supports_ranges;
                    if self.download.total_size.is_none() {
                        self.download.total_size = probe.total_size;
                    }
                }
                Err(e) => {
                    error!("Probe failed for {}: {}", self.download.url, e);
                    self.fail(vec![format!("probe failed: {}", e)]).await;
                    return Ok(());
                }
            }
        }

        self.transition(DownloadState::Planning);
        self.plan();
        Ok(())
    }

    fn plan(&mut self) {
        let download = &mut self.download;

        if download.segments.is_empty() {
            if download.total_size != Some(0) {
                download.segments = plan_segments(
                    download.total_size,
                    download.supports_ranges,
                    download.options.max_connections,
                    download.options.chunk_size,
                );
            }
            info!(
                "Planned {} segment(s) for {} (size={:?}, ranges={})",
                download.segments.len(),
                download.id,
                download.total_size,
                download.supports_ranges
            );
            return;
        }

        // A stream planned with unknown length learns it from a re-probe
        if let (Some(total), [segment]) = (download.total_size, download.segments.as_mut_slice()) {
            if segment.is_unknown_size() && total > 0 {
                segment.end = total - 1;
                segment.bytes_written = segment.bytes_written.min(total);
            }
        }

        for segment in &mut download.segments {
            if segment.state == SegmentState::InFlight {
                segment.state = SegmentState::Pending;
            }
            // Without range support a partial stream cannot be continued
            if !download.supports_ranges
                && segment.state != SegmentState::Done
                && segment.bytes_written > 0
            {
                info!(
                    "Segment {} of {} restarts from zero (no range support)",
                    segment.index, download.id
                );
                segment.bytes_written = 0;
            }
        }
    }

    async fn open_file(&mut self) -> std::io::Result<DestinationFile> {
        let path = self.download.destination.clone();

        if self.download.bytes_completed() > 0 {
            let existing = match tokio::fs::metadata(&path).await {
                Ok(meta) => Some(meta.len()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            if let Some(problem) = self.partial_file_problem(existing) {
                warn!(
                    "Partial file {:?} {}, restarting {} from zero",
                    path, problem, self.download.id
                );
                for segment in &mut self.download.segments {
                    segment.bytes_written = 0;
                    if segment.state == SegmentState::Done {
                        segment.state = SegmentState::Pending;
                    }
                }
                self.meter.reset(0);
            }
        }

        DestinationFile::open(&path, self.download.total_size).await
    }

    /// Why the file on disk cannot hold the bytes recorded as written
    fn partial_file_problem(&self, existing: Option<u64>) -> Option<String> {
        let Some(len) = existing else {
            return Some("is missing".to_string());
        };

        let written_to = self
            .download
            .segments
            .iter()
            .filter(|s| s.bytes_written > 0)
            .map(|s| s.start + s.bytes_written)
            .max()
            .unwrap_or(0);
        if len < written_to {
            return Some(format!("is {} bytes but {} were written", len, written_to));
        }

        match self.download.total_size {
            Some(total) if len > total => {
                Some(format!("is {} bytes, longer than the {} byte resource", len, total))
            }
            _ => None,
        }
    }

    // ========================================================================
    // Transfer loop
    // ========================================================================

    /// Drive workers until every segment is settled.
    /// `Err(None)` means at least one segment failed terminally.
    async fn transfer(&mut self, file: &DestinationFile) -> Result<(), Option<Interrupt>> {
        let (reports_tx, mut reports) = mpsc::unbounded_channel::<WorkerReport>();
        let worker_ctx = WorkerContext {
            download_id: self.download.id,
            url: self.source_url.clone(),
            supports_ranges: self.download.supports_ranges,
            total_size: self.download.total_size,
            file: file.clone(),
            transport: self.ctx.transport.clone(),
            governor: RateGovernor::new(self.ctx.global_limiter.clone(), self.limiter.clone()),
            timeout: Duration::from_secs(self.download.options.timeout_seconds),
            cancel: self.cancel.child_token(),
            reports: reports_tx,
        };

        let mut workers: JoinSet<()> = JoinSet::new();

        let progress_every = Duration::from_millis(self.ctx.config.progress_interval_ms.max(1));
        let mut progress_tick = tokio::time::interval_at(Instant::now() + progress_every, progress_every);
        progress_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let checkpoint_every = Duration::from_secs(self.ctx.config.checkpoint_interval_secs.max(1));
        let mut checkpoint_tick =
            tokio::time::interval_at(Instant::now() + checkpoint_every, checkpoint_every);
        checkpoint_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            self.spawn_ready(&mut workers, &worker_ctx);

            if workers.is_empty() {
                match self.settled() {
                    Some(true) => break Ok(()),
                    Some(false) => break Err(None),
                    None => {}
                }
            }

            let wake = self.retries.next_wakeup(Instant::now());

            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if let Some(interrupt) = self.apply_command(command).await {
                        break Err(Some(interrupt));
                    }
                }
                _ = self.cancel.cancelled() => break Err(Some(Interrupt::Pause)),
                Some(report) = reports.recv() => self.handle_report(report),
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Segment task for {} ended abnormally: {}", self.download.id, e);
                    }
                }
                _ = progress_tick.tick() => self.publish_progress(false),
                _ = checkpoint_tick.tick() => self.checkpoint().await,
                _ = sleep_until(wake), if wake.is_some() => {}
            }
        };

        // Stop and drain whatever is still running
        self.cancel.cancel();
        while workers.join_next().await.is_some() {}
        while let Ok(report) = reports.try_recv() {
            self.handle_report(report);
        }
        for segment in &mut self.download.segments {
            if segment.state == SegmentState::InFlight {
                segment.state = SegmentState::Pending;
            }
        }

        result
    }

    /// Spawn workers for Pending segments whose backoff has elapsed
    fn spawn_ready(&mut self, workers: &mut JoinSet<()>, ctx: &WorkerContext) {
        let now = Instant::now();
        let limit = self.download.options.max_connections.max(1) as usize;

        for segment in &mut self.download.segments {
            if workers.len() >= limit {
                break;
            }
            if segment.state != SegmentState::Pending || !self.retries.is_eligible(segment.index, now) {
                continue;
            }

            self.retries.clear(segment.index);
            segment.state = SegmentState::InFlight;

            let worker = SegmentWorker::new(ctx.clone(), segment);
            let reports = ctx.reports.clone();
            let index = segment.index;
            workers.spawn(async move {
                if AssertUnwindSafe(worker.run()).catch_unwind().await.is_err() {
                    let _ = reports.send(WorkerReport {
                        index,
                        event: WorkerEvent::Failed(SegmentError::Internal(
                            "worker panicked".to_string(),
                        )),
                    });
                }
            });
        }
    }

    /// `Some(true)` when all segments are Done, `Some(false)` when nothing can
    /// make progress and a segment has failed, `None` otherwise
    fn settled(&self) -> Option<bool> {
        if self.download.all_segments_done() {
            return Some(true);
        }
        if self
            .download
            .segments
            .iter()
            .any(|s| matches!(s.state, SegmentState::Pending | SegmentState::InFlight))
        {
            return None;
        }
        Some(false)
    }

    async fn apply_command(&mut self, command: Option<TaskCommand>) -> Option<Interrupt> {
        match command {
            Some(TaskCommand::Pause) | None => Some(Interrupt::Pause),
            Some(TaskCommand::Cancel { delete_partial }) => Some(Interrupt::Cancel { delete_partial }),
            Some(TaskCommand::SetSpeedLimit(limit)) => {
                let limit = limit.filter(|l| *l > 0);
                info!("Speed limit for {} set to {:?}", self.download.id, limit);
                self.download.options.speed_limit = limit;
                self.limiter.set_limit(limit).await;
                None
            }
        }
    }

    fn handle_report(&mut self, report: WorkerReport) {
        let Some(pos) = self
            .download
            .segments
            .iter()
            .position(|s| s.index == report.index)
        else {
            warn!("Report for unknown segment {}", report.index);
            return;
        };

        match report.event {
            WorkerEvent::Progress(bytes) => {
                self.download.segments[pos].bytes_written += bytes;
                self.progress_dirty = true;
            }
            WorkerEvent::SizeDiscovered(total) => {
                self.download.total_size = Some(total);
                let segment = &mut self.download.segments[pos];
                if segment.is_unknown_size() {
                    segment.end = segment.start + total - 1;
                }
            }
            WorkerEvent::Done => {
                let segment = &mut self.download.segments[pos];
                segment.state = SegmentState::Done;
                if segment.is_unknown_size() {
                    // Stream ended; its length is whatever arrived
                    let total = segment.bytes_written;
                    self.download.total_size = Some(total);
                    if total == 0 {
                        self.download.segments.clear();
                    } else {
                        segment.end = segment.start + total - 1;
                    }
                }
                self.retries.clear(report.index);
                self.progress_dirty = true;
            }
            WorkerEvent::Stopped => {
                self.download.segments[pos].state = SegmentState::Pending;
            }
            WorkerEvent::Failed(err) => self.handle_failure(pos, err),
        }
    }

    fn handle_failure(&mut self, pos: usize, err: SegmentError) {
        let supports_ranges = self.download.supports_ranges;
        let segment = &mut self.download.segments[pos];
        segment.retry_count += 1;
        segment.last_error = Some(err.to_string());

        let terminal = !err.is_retryable() || self.policy.is_exhausted(segment.retry_count);
        if terminal {
            segment.state = SegmentState::Failed;
            error!(
                "Segment {} of {} failed after {} attempt(s): {}",
                segment.index, self.download.id, segment.retry_count, err
            );
        } else {
            segment.state = SegmentState::Pending;
            if !supports_ranges && segment.bytes_written > 0 {
                // Non-resumable stream starts over
                segment.bytes_written = 0;
                self.progress_dirty = true;
            }
            let delay = self.policy.delay_for(segment.retry_count);
            self.retries.schedule(segment.index, delay);
            warn!(
                "Segment {} of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                segment.index,
                self.download.id,
                segment.retry_count,
                self.policy.max_attempts,
                err,
                delay
            );
        }

        let event = EngineEvent::SegmentFailed {
            id: self.download.id,
            segment_index: segment.index,
            attempt: segment.retry_count,
            reason: err.to_string(),
            terminal,
        };
        self.ctx.events.publish(event);
    }

    fn failure_reasons(&self) -> Vec<String> {
        self.download
            .segments
            .iter()
            .filter(|s| s.state == SegmentState::Failed)
            .map(|s| {
                format!(
                    "segment {}: {}",
                    s.index,
                    s.last_error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect()
    }

    // ========================================================================
    // Terminal transitions
    // ========================================================================

    async fn complete(&mut self, file: &DestinationFile) {
        let written = self.download.bytes_completed();
        let total = *self.download.total_size.get_or_insert(written);

        if written != total {
            self.fail(vec![format!(
                "integrity check failed: wrote {} of {} bytes",
                written, total
            )])
            .await;
            return;
        }

        let synced = async {
            let len = file.len().await?;
            if len > total {
                // Leftovers of an earlier, longer stream
                file.truncate(total).await?;
            }
            file.sync().await?;
            file.len().await
        }
        .await;

        match synced {
            Ok(len) if len == total => {}
            Ok(len) => {
                self.fail(vec![format!(
                    "integrity check failed: file is {} bytes, expected {}",
                    len, total
                )])
                .await;
                return;
            }
            Err(e) => {
                self.fail(vec![format!("cannot finalize destination: {}", e)]).await;
                return;
            }
        }

        self.download.completed_at = Some(Utc::now());
        self.transition(DownloadState::Completed);
        self.checkpoint().await;
        self.ctx.events.publish(EngineEvent::DownloadCompleted {
            id: self.download.id,
            total_bytes: total,
        });
        info!("Download completed: {} ({} bytes)", self.download.id, total);
    }

    async fn fail(&mut self, reasons: Vec<String>) {
        error!("Download {} failed: {:?}", self.download.id, reasons);
        self.download.failure_reasons = reasons.clone();
        self.transition(DownloadState::Failed);
        self.checkpoint().await;
        self.ctx.events.publish(EngineEvent::DownloadFailed {
            id: self.download.id,
            reasons,
        });
    }

    async fn interrupt(&mut self, interrupt: Interrupt, file: Option<&DestinationFile>) {
        if let Some(file) = file {
            if let Err(e) = file.sync().await {
                warn!("Failed to sync {:?}: {}", file.path(), e);
            }
        }

        match interrupt {
            Interrupt::Pause => {
                self.transition(DownloadState::Paused);
                self.meter.reset(self.download.bytes_completed());
                self.checkpoint().await;
                self.ctx.events.publish(EngineEvent::DownloadPaused {
                    id: self.download.id,
                    bytes_completed: self.download.bytes_completed(),
                });
                info!("Download paused: {}", self.download.id);
            }
            Interrupt::Cancel { delete_partial } => {
                let partial_deleted = delete_partial && remove_partial(&self.download).await;
                self.transition(DownloadState::Cancelled);
                self.checkpoint().await;
                self.ctx.events.publish(EngineEvent::DownloadCancelled {
                    id: self.download.id,
                    partial_deleted,
                });
                info!("Download cancelled: {}", self.download.id);
            }
        }
    }

    // ========================================================================
    // Progress and checkpoints
    // ========================================================================

    fn transition(&mut self, next: DownloadState) {
        let current = self.download.state;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                "Unexpected transition {} -> {} for {}",
                current, next, self.download.id
            );
        }
        debug!("Download {}: {} -> {}", self.download.id, current, next);
        self.download.state = next;
        self.publish_progress(true);
    }

    /// Refresh the shared snapshot; publish when something changed
    fn publish_progress(&mut self, force: bool) {
        let rate = if self.download.state == DownloadState::Running {
            self.meter.sample(self.download.bytes_completed())
        } else {
            0
        };
        let snapshot = ProgressSnapshot::from_download(&self.download, rate);
        *self.snapshot.write() = snapshot.clone();

        if force || self.progress_dirty {
            self.progress_dirty = false;
            self.ctx.events.publish(EngineEvent::ProgressUpdated(snapshot));
        }
    }

    /// Save a resume token; failures degrade to in-memory operation
    async fn checkpoint(&mut self) {
        let token = ResumeToken::from_download(&self.download);
        if let Err(e) = self.ctx.gateway.save(self.download.id, &token).await {
            warn!("Failed to save resume token for {}: {}", self.download.id, e);
            self.ctx.events.publish(EngineEvent::PersistenceDegraded {
                id: self.download.id,
                reason: e.to_string(),
            });
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Delete the partial destination file, true if something was removed
pub(crate) async fn remove_partial(download: &Download) -> bool {
    match tokio::fs::remove_file(&download.destination).await {
        Ok(()) => {
            info!("Deleted partial file {:?}", download.destination);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to delete {:?}: {}", download.destination, e);
            false
        }
    }
}
