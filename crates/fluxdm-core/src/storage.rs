//! JSON file storage: one resume token document per download

use crate::engine::{validate_token, PersistenceGateway};
use crate::error::PersistError;
use async_trait::async_trait;
use fluxdm_types::{DownloadId, ResumeToken};
use std::path::PathBuf;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

/// Stores `<id>.json` files under a directory. Engines opened with
/// [`StoreKind::Json`](crate::StoreKind) keep their tokens here.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub async fn new(dir: PathBuf) -> Result<Self, PersistError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: DownloadId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl PersistenceGateway for JsonFileStore {
    async fn save(&self, id: DownloadId, token: &ResumeToken) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(token)?;

        // Write then rename so a crash never leaves a half-written token
        let tmp = self.dir.join(format!("{}.json.tmp", id));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.path_for(id)).await?;

        Ok(())
    }

    async fn load(&self, id: DownloadId) -> Result<Option<ResumeToken>, PersistError> {
        let path = self.path_for(id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let token: ResumeToken = serde_json::from_str(&content)?;
        validate_token(&token)?;
        Ok(Some(token))
    }

    async fn list(&self) -> Result<Vec<DownloadId>, PersistError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match Uuid::parse_str(&stem) {
                    Ok(id) => ids.push(id),
                    Err(_) => warn!("Ignoring stray file in token directory: {:?}", path),
                }
            }
        }

        Ok(ids)
    }

    async fn delete(&self, id: DownloadId) -> Result<(), PersistError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
