//! Engine configuration stored as `config.json` in the data directory

use crate::error::{FluxError, PersistError, SpecError};
use fluxdm_types::EngineConfig;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.json";

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Load the config, falling back to defaults when the file does not exist.
/// Missing keys take their default value.
pub async fn load_config(data_dir: &Path) -> Result<EngineConfig, FluxError> {
    let path = config_path(data_dir);
    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config at {:?}, using defaults", path);
            return Ok(EngineConfig::default());
        }
        Err(e) => return Err(e.into()),
    };

    let config: EngineConfig =
        serde_json::from_str(&content).map_err(|e| FluxError::Persist(PersistError::from(e)))?;
    validate_config(&config)?;
    Ok(config)
}

pub async fn save_config(data_dir: &Path, config: &EngineConfig) -> Result<(), FluxError> {
    validate_config(config)?;
    fs::create_dir_all(data_dir).await?;

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| FluxError::Persist(PersistError::from(e)))?;
    fs::write(config_path(data_dir), content).await?;

    info!("Saved config to {:?}", config_path(data_dir));
    Ok(())
}

/// Reject values that would stall the engine
pub fn validate_config(config: &EngineConfig) -> Result<(), SpecError> {
    let positive = [
        ("max_connections", u64::from(config.max_connections)),
        ("chunk_size", config.chunk_size),
        ("timeout_seconds", config.timeout_seconds),
        ("retry_attempts", u64::from(config.retry_attempts)),
        ("checkpoint_interval_secs", config.checkpoint_interval_secs),
        ("progress_interval_ms", config.progress_interval_ms),
        ("refill_interval_ms", config.refill_interval_ms),
        ("event_queue_capacity", config.event_queue_capacity as u64),
        ("connect_timeout_secs", config.connect_timeout_secs),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(SpecError::InvalidOption(format!("{} must be at least 1", name)));
        }
    }

    if !(config.backoff_multiplier >= 1.0) {
        return Err(SpecError::InvalidOption(
            "backoff_multiplier must be at least 1.0".to_string(),
        ));
    }
    if config.backoff_max_ms < config.backoff_base_ms {
        return Err(SpecError::InvalidOption(
            "backoff_max_ms must not be below backoff_base_ms".to_string(),
        ));
    }

    Ok(())
}
