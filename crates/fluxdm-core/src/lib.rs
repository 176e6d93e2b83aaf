//! FluxDM Core - Download Engine
//!
//! This crate provides the core download functionality for FluxDM.
//! It handles probing, multi-segment downloads, retries, pause/resume
//! and durable resume tokens.

mod config;
mod engine;
mod error;
mod events;
mod storage;

pub use config::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use storage::*;

pub use fluxdm_types;

use fluxdm_types::{Download, DownloadId, DownloadOptions, EngineConfig, ProgressSnapshot};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// SQLite database holding resume tokens, inside the data directory
pub const DATABASE_FILE: &str = "downloads.db";

/// Directory of per-download JSON tokens, inside the data directory
pub const TOKENS_DIR: &str = "tokens";

/// Where an opened engine keeps its resume tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreKind {
    /// `<data_dir>/downloads.db`
    #[default]
    Sqlite,
    /// `<data_dir>/tokens/<id>.json`
    Json,
}

/// The main FluxDM engine instance
pub struct FluxEngine {
    /// Download manager
    manager: DownloadManager,
    data_dir: Option<PathBuf>,
}

impl FluxEngine {
    /// Open an engine backed by `<data_dir>/downloads.db`, talking HTTP
    pub async fn open(data_dir: PathBuf, config: EngineConfig) -> Result<Self, FluxError> {
        Self::open_with_store(data_dir, config, StoreKind::Sqlite).await
    }

    /// Open an engine in `data_dir` with the chosen token store
    pub async fn open_with_store(
        data_dir: PathBuf,
        config: EngineConfig,
        store: StoreKind,
    ) -> Result<Self, FluxError> {
        validate_config(&config)?;
        tokio::fs::create_dir_all(&data_dir).await?;

        let gateway: Arc<dyn PersistenceGateway> = match store {
            StoreKind::Sqlite => Arc::new(SqliteStore::new(data_dir.join(DATABASE_FILE)).await?),
            StoreKind::Json => Arc::new(JsonFileStore::new(data_dir.join(TOKENS_DIR)).await?),
        };
        let transport = HttpTransport::new(&config)?;
        info!("Opened FluxDM engine in {:?} ({:?} store)", data_dir, store);

        let mut engine = Self::new(config, Arc::new(transport), gateway);
        engine.data_dir = Some(data_dir);
        Ok(engine)
    }

    /// Build an engine from explicit collaborators
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            manager: DownloadManager::new(config, transport, gateway),
            data_dir: None,
        }
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    pub fn config(&self) -> &EngineConfig {
        self.manager.config()
    }

    pub fn data_dir(&self) -> Option<&PathBuf> {
        self.data_dir.as_ref()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> EventSubscriber {
        self.manager.subscribe()
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    pub async fn add(
        &self,
        url: &str,
        destination: PathBuf,
        options: DownloadOptions,
    ) -> Result<DownloadId, FluxError> {
        self.manager.add(url, destination, options).await
    }

    pub async fn pause(&self, id: DownloadId) -> Result<(), FluxError> {
        self.manager.pause(id).await
    }

    pub async fn resume(&self, id: DownloadId) -> Result<(), FluxError> {
        self.manager.resume(id).await
    }

    pub async fn cancel(&self, id: DownloadId) -> Result<(), FluxError> {
        self.manager.cancel(id).await
    }

    pub async fn cancel_with(&self, id: DownloadId, delete_partial: bool) -> Result<(), FluxError> {
        self.manager.cancel_with(id, delete_partial).await
    }

    pub async fn remove(&self, id: DownloadId, delete_file: bool) -> Result<(), FluxError> {
        self.manager.remove(id, delete_file).await
    }

    pub async fn get_snapshot(&self, id: DownloadId) -> Result<ProgressSnapshot, FluxError> {
        self.manager.get_snapshot(id).await
    }

    pub async fn get_download(&self, id: DownloadId) -> Result<Download, FluxError> {
        self.manager.get_download(id).await
    }

    pub async fn list(&self) -> Vec<Download> {
        self.manager.list().await
    }

    pub async fn probe(&self, url: &str) -> Result<ProbeResult, FluxError> {
        self.manager.probe(url).await
    }

    /// Probe several URLs concurrently, keeping input order
    pub async fn probe_many(&self, urls: &[String]) -> Vec<Result<ProbeResult, FluxError>> {
        futures::future::join_all(urls.iter().map(|url| self.manager.probe(url))).await
    }

    pub async fn restore(&self, auto_resume: bool) -> Result<Vec<DownloadId>, FluxError> {
        self.manager.restore(auto_resume).await
    }

    pub async fn set_speed_limit(&self, id: DownloadId, limit: Option<u64>) -> Result<(), FluxError> {
        self.manager.set_speed_limit(id, limit).await
    }

    pub async fn set_global_speed_limit(&self, limit: Option<u64>) {
        self.manager.set_global_speed_limit(limit).await
    }

    /// Pause and persist every running download
    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }
}
