//! Download Manager - registry of every download the engine knows about
//!
//! Running downloads are owned by their task; everything else (paused or
//! terminal) is parked here. The manager is the only writer of tokens for
//! parked downloads.

use crate::engine::download_task::{remove_partial, spawn_task, TaskCommand, TaskContext, TaskHandle};
use crate::engine::persistence::PersistenceGateway;
use crate::engine::prober::{ProbeResult, RangeProber};
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::transport::Transport;
use crate::error::{FluxError, SpecError};
use crate::events::{EventBus, EventSubscriber};
use fluxdm_types::{
    Download, DownloadId, DownloadOptions, DownloadState, EngineConfig, EngineEvent,
    ProgressSnapshot, ResumeToken,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

enum Slot {
    Running(RunningDownload),
    Parked(Download),
}

struct RunningDownload {
    handle: TaskHandle,
    /// The download as handed to the task, for display while it runs
    base: Download,
}

impl RunningDownload {
    /// Current view: the base download overlaid with the live snapshot
    fn download(&self) -> Download {
        let snapshot = self.handle.snapshot();
        let mut download = self.base.clone();
        download.state = snapshot.state;
        download.total_size = snapshot.total_bytes;
        download.segments = snapshot
            .segments
            .iter()
            .map(|p| {
                let previous = self.base.segments.iter().find(|s| s.index == p.index);
                fluxdm_types::Segment {
                    index: p.index,
                    start: p.start,
                    end: p.end,
                    bytes_written: p.bytes_written,
                    state: p.state,
                    retry_count: p.retry_count,
                    last_error: previous.and_then(|s| s.last_error.clone()),
                }
            })
            .collect();
        download
    }
}

/// Download manager that coordinates all downloads
pub struct DownloadManager {
    registry: Arc<RwLock<HashMap<DownloadId, Slot>>>,
    ctx: TaskContext,
}

impl DownloadManager {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let refill = Duration::from_millis(config.refill_interval_ms);
        let ctx = TaskContext {
            global_limiter: RateLimiter::new(config.global_speed_limit, refill),
            events: EventBus::new(config.event_queue_capacity),
            config: Arc::new(config),
            transport,
            gateway,
            root: CancellationToken::new(),
        };

        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            ctx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.ctx.events.subscribe()
    }

    /// Probe a URL for size and range support without downloading it
    pub async fn probe(&self, url: &str) -> Result<ProbeResult, FluxError> {
        let parsed = parse_url(url)?;
        let prober = RangeProber::new(
            self.ctx.transport.clone(),
            Duration::from_secs(self.ctx.config.timeout_seconds),
            self.ctx.config.probe_with_range_request,
        );
        Ok(prober.probe(parsed.as_str()).await?)
    }

    /// Validate and start a new download
    pub async fn add(
        &self,
        url: &str,
        destination: PathBuf,
        options: DownloadOptions,
    ) -> Result<DownloadId, FluxError> {
        validate_spec(url, &destination, &options).await?;

        let options = self.ctx.config.resolve(&options);
        let download = Download::new(url.trim().to_string(), destination, options);
        let id = download.id;
        info!("Adding download {}: {} -> {:?}", id, download.url, download.destination);

        let handle = spawn_task(download.clone(), self.ctx.clone(), false);
        self.registry.write().await.insert(
            id,
            Slot::Running(RunningDownload {
                handle,
                base: download,
            }),
        );

        Ok(id)
    }

    /// Pause a running download, waiting until its workers have stopped
    pub async fn pause(&self, id: DownloadId) -> Result<(), FluxError> {
        {
            let mut registry = self.registry.write().await;
            settle(&mut registry);
            match registry.get(&id) {
                None => return Err(FluxError::NotFound(id)),
                Some(Slot::Parked(d)) if d.state == DownloadState::Paused => return Ok(()),
                Some(Slot::Parked(d)) => {
                    return Err(FluxError::InvalidOperation(format!(
                        "cannot pause a {} download",
                        d.state
                    )))
                }
                Some(Slot::Running(running)) => {
                    running.handle.send(TaskCommand::Pause);
                    info!("Signaled pause for download {}", id);
                }
            }
        }

        let download = self.wait_for(id).await?;
        if download.state != DownloadState::Paused {
            debug!("Download {} finished as {} before pausing", id, download.state);
        }
        Ok(())
    }

    /// Resume a paused download from memory or from its stored token
    pub async fn resume(&self, id: DownloadId) -> Result<(), FluxError> {
        self.await_exiting(id).await;
        let mut registry = self.registry.write().await;
        settle(&mut registry);
        self.ensure_loaded(&mut registry, id).await?;

        let download = match registry.remove(&id) {
            Some(Slot::Parked(download)) => download,
            Some(running @ Slot::Running(_)) => {
                registry.insert(id, running);
                return Ok(());
            }
            None => return Err(FluxError::NotFound(id)),
        };

        if download.state != DownloadState::Paused {
            let state = download.state;
            registry.insert(id, Slot::Parked(download));
            return Err(FluxError::InvalidOperation(format!(
                "cannot resume a {} download",
                state
            )));
        }

        info!("Resuming download {} at {} bytes", id, download.bytes_completed());
        let handle = spawn_task(download.clone(), self.ctx.clone(), true);
        registry.insert(
            id,
            Slot::Running(RunningDownload {
                handle,
                base: download,
            }),
        );
        Ok(())
    }

    /// Cancel using the configured partial-file policy
    pub async fn cancel(&self, id: DownloadId) -> Result<(), FluxError> {
        self.cancel_with(id, self.ctx.config.delete_partial_on_cancel)
            .await
    }

    /// Cancel a download; terminal
    pub async fn cancel_with(&self, id: DownloadId, delete_partial: bool) -> Result<(), FluxError> {
        self.await_exiting(id).await;
        {
            let mut registry = self.registry.write().await;
            settle(&mut registry);
            self.ensure_loaded(&mut registry, id).await?;

            match registry.get_mut(&id) {
                None => return Err(FluxError::NotFound(id)),
                Some(Slot::Running(running)) => {
                    running.handle.send(TaskCommand::Cancel { delete_partial });
                    info!("Signaled cancel for download {}", id);
                }
                Some(Slot::Parked(download)) if download.state.is_terminal() => {
                    return Err(FluxError::InvalidOperation(format!(
                        "cannot cancel a {} download",
                        download.state
                    )))
                }
                Some(Slot::Parked(download)) => {
                    let partial_deleted = delete_partial && remove_partial(download).await;
                    download.state = DownloadState::Cancelled;
                    self.save_parked(download).await;
                    self.ctx.events.publish(EngineEvent::DownloadCancelled {
                        id,
                        partial_deleted,
                    });
                    info!("Cancelled download {}", id);
                    return Ok(());
                }
            }
        }

        self.wait_for(id).await?;
        Ok(())
    }

    /// Forget a paused or finished download, optionally deleting its file
    pub async fn remove(&self, id: DownloadId, delete_file: bool) -> Result<(), FluxError> {
        self.await_exiting(id).await;
        let mut registry = self.registry.write().await;
        settle(&mut registry);
        self.ensure_loaded(&mut registry, id).await?;

        let download = match registry.remove(&id) {
            Some(Slot::Parked(download)) => download,
            Some(running @ Slot::Running(_)) => {
                registry.insert(id, running);
                return Err(FluxError::InvalidOperation(
                    "pause or cancel the download before removing it".to_string(),
                ));
            }
            None => return Err(FluxError::NotFound(id)),
        };
        drop(registry);

        if delete_file {
            remove_partial(&download).await;
        }
        self.ctx.gateway.delete(id).await?;
        info!("Removed download {}", id);
        Ok(())
    }

    pub async fn get_snapshot(&self, id: DownloadId) -> Result<ProgressSnapshot, FluxError> {
        let registry = self.registry.read().await;
        match registry.get(&id) {
            Some(Slot::Running(running)) => match running.handle.finished() {
                Some(download) => Ok(ProgressSnapshot::from_download(&download, 0)),
                None => Ok(running.handle.snapshot()),
            },
            Some(Slot::Parked(download)) => Ok(ProgressSnapshot::from_download(download, 0)),
            None => Err(FluxError::NotFound(id)),
        }
    }

    pub async fn get_download(&self, id: DownloadId) -> Result<Download, FluxError> {
        let registry = self.registry.read().await;
        registry
            .get(&id)
            .map(slot_download)
            .ok_or(FluxError::NotFound(id))
    }

    /// Every known download, oldest first
    pub async fn list(&self) -> Vec<Download> {
        let registry = self.registry.read().await;
        let mut downloads: Vec<Download> = registry.values().map(slot_download).collect();
        downloads.sort_by_key(|d| d.created_at);
        downloads
    }

    /// Number of downloads with a live task
    pub async fn active_count(&self) -> usize {
        let registry = self.registry.read().await;
        registry
            .values()
            .filter(|slot| matches!(slot, Slot::Running(r) if r.handle.finished().is_none()))
            .count()
    }

    /// Load every stored token. Downloads interrupted mid-run are parked as
    /// Paused and, with `auto_resume`, started again.
    pub async fn restore(&self, auto_resume: bool) -> Result<Vec<DownloadId>, FluxError> {
        let ids = self.ctx.gateway.list().await?;
        let mut restored = Vec::new();
        let mut interrupted = Vec::new();

        {
            let mut registry = self.registry.write().await;
            for id in ids {
                if registry.contains_key(&id) {
                    continue;
                }
                let token = match self.ctx.gateway.load(id).await {
                    Ok(Some(token)) => token,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Skipping stored download {}: {}", id, e);
                        continue;
                    }
                };

                let mut download = token.into_download();
                if !download.state.is_terminal() && download.state != DownloadState::Paused {
                    info!("Download {} was interrupted while {}", id, download.state);
                    download.state = DownloadState::Paused;
                    self.save_parked(&download).await;
                    interrupted.push(id);
                }
                registry.insert(id, Slot::Parked(download));
                restored.push(id);
            }
        }

        info!("Restored {} download(s) from storage", restored.len());

        if auto_resume {
            for id in interrupted {
                if let Err(e) = self.resume(id).await {
                    warn!("Failed to auto-resume {}: {}", id, e);
                }
            }
        }

        Ok(restored)
    }

    /// Change (or clear) a download's own speed ceiling
    pub async fn set_speed_limit(&self, id: DownloadId, limit: Option<u64>) -> Result<(), FluxError> {
        let limit = limit.filter(|l| *l > 0);
        let mut registry = self.registry.write().await;
        settle(&mut registry);

        match registry.get_mut(&id) {
            None => Err(FluxError::NotFound(id)),
            Some(Slot::Running(running)) => {
                running.base.options.speed_limit = limit;
                running.handle.send(TaskCommand::SetSpeedLimit(limit));
                Ok(())
            }
            Some(Slot::Parked(download)) => {
                download.options.speed_limit = limit;
                self.save_parked(download).await;
                Ok(())
            }
        }
    }

    /// Change (or clear) the ceiling shared by all downloads
    pub async fn set_global_speed_limit(&self, limit: Option<u64>) {
        info!("Global speed limit set to {:?}", limit);
        self.ctx.global_limiter.set_limit(limit).await;
    }

    /// Pause every running download and wait for them to persist
    pub async fn shutdown(&self) {
        let ids: Vec<DownloadId> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Running(running) if running.handle.finished().is_none() => Some(*id),
                    _ => None,
                })
                .collect()
        };

        info!("Shutting down, pausing {} download(s)", ids.len());
        for id in ids {
            if let Err(e) = self.pause(id).await {
                warn!("Failed to pause {} on shutdown: {}", id, e);
            }
        }
        self.ctx.root.cancel();
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// A task whose snapshot is already Paused or terminal is on its way out;
    /// let it finish so the caller acts on the parked download
    async fn await_exiting(&self, id: DownloadId) {
        let exiting = {
            let registry = self.registry.read().await;
            match registry.get(&id) {
                Some(Slot::Running(running)) if running.handle.finished().is_none() => {
                    let state = running.handle.snapshot().state;
                    state.is_terminal() || state == DownloadState::Paused
                }
                _ => false,
            }
        };
        if exiting {
            let _ = self.wait_for(id).await;
        }
    }

    /// Wait for a running task to exit, then park its download
    async fn wait_for(&self, id: DownloadId) -> Result<Download, FluxError> {
        let handle = {
            let registry = self.registry.read().await;
            match registry.get(&id) {
                Some(Slot::Running(running)) => running.handle.clone(),
                Some(Slot::Parked(download)) => return Ok(download.clone()),
                None => return Err(FluxError::NotFound(id)),
            }
        };

        let download = handle.wait().await;
        let mut registry = self.registry.write().await;
        let replaced = matches!(
            registry.get(&id),
            Some(Slot::Running(running)) if running.handle.finished().is_none()
        );
        match download {
            Ok(download) => {
                if !replaced {
                    registry.insert(id, Slot::Parked(download.clone()));
                }
                Ok(download)
            }
            Err(e) => {
                // The task died without a final state; its last token is all we have
                if !replaced {
                    registry.remove(&id);
                }
                Err(e)
            }
        }
    }

    /// Bring a stored download into the registry if it is not there yet
    async fn ensure_loaded(
        &self,
        registry: &mut HashMap<DownloadId, Slot>,
        id: DownloadId,
    ) -> Result<(), FluxError> {
        if registry.contains_key(&id) {
            return Ok(());
        }

        let token = self
            .ctx
            .gateway
            .load(id)
            .await?
            .ok_or(FluxError::NotFound(id))?;
        let mut download = token.into_download();
        if !download.state.is_terminal() {
            download.state = DownloadState::Paused;
        }
        registry.insert(id, Slot::Parked(download));
        Ok(())
    }

    async fn save_parked(&self, download: &Download) {
        let token = ResumeToken::from_download(download);
        if let Err(e) = self.ctx.gateway.save(download.id, &token).await {
            warn!("Failed to save resume token for {}: {}", download.id, e);
            self.ctx.events.publish(EngineEvent::PersistenceDegraded {
                id: download.id,
                reason: e.to_string(),
            });
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        // Running tasks observe this as a pause
        self.ctx.root.cancel();
    }
}

/// Move finished tasks into the parked set
fn settle(registry: &mut HashMap<DownloadId, Slot>) {
    for slot in registry.values_mut() {
        if let Slot::Running(running) = slot {
            if let Some(download) = running.handle.finished() {
                *slot = Slot::Parked(download);
            }
        }
    }
}

fn slot_download(slot: &Slot) -> Download {
    match slot {
        Slot::Running(running) => running
            .handle
            .finished()
            .unwrap_or_else(|| running.download()),
        Slot::Parked(download) => download.clone(),
    }
}

fn parse_url(url: &str) -> Result<Url, SpecError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(SpecError::EmptyUrl);
    }

    let parsed = Url::parse(url).map_err(|e| SpecError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(SpecError::UnsupportedScheme(other.to_string())),
    }
}

/// Reject a download spec before any task is spawned
pub async fn validate_spec(
    url: &str,
    destination: &Path,
    options: &DownloadOptions,
) -> Result<(), SpecError> {
    parse_url(url)?;

    if tokio::fs::metadata(destination)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return Err(SpecError::Destination(format!(
            "{} is a directory",
            destination.display()
        )));
    }

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let meta = tokio::fs::metadata(parent).await.map_err(|_| {
        SpecError::Destination(format!("{} does not exist", parent.display()))
    })?;
    if !meta.is_dir() {
        return Err(SpecError::Destination(format!(
            "{} is not a directory",
            parent.display()
        )));
    }
    if meta.permissions().readonly() {
        return Err(SpecError::Destination(format!(
            "{} is read-only",
            parent.display()
        )));
    }

    let positive = [
        ("max_connections", options.max_connections.map(u64::from)),
        ("chunk_size", options.chunk_size),
        ("timeout_seconds", options.timeout_seconds),
        ("retry_attempts", options.retry_attempts.map(u64::from)),
    ];
    for (name, value) in positive {
        if value == Some(0) {
            return Err(SpecError::InvalidOption(format!("{} must be at least 1", name)));
        }
    }

    Ok(())
}
