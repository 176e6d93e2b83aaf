//! CLI command implementations

use crate::output::{format_bytes, format_size, print_json, state_icon, truncate};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, GetArgs, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use fluxdm_core::{load_config, save_config, FluxEngine};
use fluxdm_types::{Download, DownloadId, DownloadOptions, DownloadState, EngineConfig, EngineEvent};
use serde::Serialize;
use std::path::{Path, PathBuf};
use url::Url;
use uuid::Uuid;

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get(engine: &FluxEngine, args: GetArgs, format: OutputFormat) -> Result<()> {
    let destination = destination_for(&args.url, args.output)?;
    let options = DownloadOptions {
        max_connections: args.connections,
        chunk_size: args.chunk_size,
        timeout_seconds: args.timeout,
        retry_attempts: args.retries,
        speed_limit: args.limit,
    };

    // Subscribe first so the start event is not missed
    let mut events = engine.subscribe();
    let id = engine.add(&args.url, destination, options).await?;

    if matches!(format, OutputFormat::Human) {
        println!("{} Added download {}", style("+").green().bold(), style(id).dim());
    }
    follow(engine, id, &mut events, format).await
}

pub async fn resume(engine: &FluxEngine, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    let mut events = engine.subscribe();
    engine.resume(id).await?;
    follow(engine, id, &mut events, format).await
}

/// Show progress until the download stops. Ctrl-C pauses it.
async fn follow(
    engine: &FluxEngine,
    id: DownloadId,
    events: &mut fluxdm_core::EventSubscriber,
    format: OutputFormat,
) -> Result<()> {
    let progress = DownloadProgress::new();
    if matches!(format, OutputFormat::Human) {
        progress.add_download(&engine.get_download(id).await?).await;
    }

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.download_id() != id {
                    continue;
                }
                progress.handle_event(&event).await;
                if event.is_terminal() || matches!(event, EngineEvent::DownloadPaused { .. }) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                engine.pause(id).await?;
            }
        }
    }
    progress.clear().await;

    let download = engine.get_download(id).await?;
    match format {
        OutputFormat::Json => print_json(&download)?,
        OutputFormat::Human | OutputFormat::Table => match download.state {
            DownloadState::Completed => println!(
                "{} Saved {} ({})",
                style("✓").green().bold(),
                download.destination.display(),
                format_size(download.total_size)
            ),
            DownloadState::Paused => println!(
                "{} Paused at {}. Resume with: fluxdm resume {}",
                style("⏸").yellow(),
                format_bytes(download.bytes_completed()),
                download.id
            ),
            _ => print_download_summary(&download, true),
        },
    }

    match download.state {
        DownloadState::Failed => Err(anyhow!(
            "download failed: {}",
            download.failure_reasons.join("; ")
        )),
        _ => Ok(()),
    }
}

pub async fn list_downloads(
    engine: &FluxEngine,
    state_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let state_filter: Option<DownloadState> = state_filter
        .map(|s| s.to_lowercase().parse().map_err(|e: String| anyhow!(e)))
        .transpose()?;

    let filtered: Vec<Download> = engine
        .list()
        .await
        .into_iter()
        .filter(|d| state_filter.map(|s| d.state == s).unwrap_or(true))
        .collect();

    match format {
        OutputFormat::Json => print_json(&filtered)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DownloadRow {
                id: String,
                file: String,
                size: String,
                progress: String,
                state: String,
            }

            let rows: Vec<DownloadRow> = filtered
                .iter()
                .map(|d| DownloadRow {
                    id: short_id(d.id),
                    file: truncate(&d.file_name(), 30),
                    size: format_size(d.total_size),
                    progress: format!("{:.1}%", d.progress()),
                    state: d.state.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if filtered.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for download in &filtered {
                print_download_summary(download, show_all);
            }
            println!();
            println!("{} download(s) total", style(filtered.len()).bold());
        }
    }

    Ok(())
}

fn print_download_summary(download: &Download, detailed: bool) {
    let progress = format!("{:.1}%", download.progress());

    println!(
        "{} {} {} [{}] {}",
        state_icon(download.state),
        style(download.file_name()).bold(),
        style(&progress).dim(),
        style(download.state).dim(),
        style(short_id(download.id)).dim()
    );

    if detailed {
        println!("    ID: {}", download.id);
        println!("    URL: {}", download.url);
        println!("    Path: {}", download.destination.display());
        println!(
            "    Size: {} / {}",
            format_bytes(download.bytes_completed()),
            format_size(download.total_size)
        );
        println!(
            "    Ranges: {}",
            if download.supports_ranges { "yes" } else { "no" }
        );
        for reason in &download.failure_reasons {
            println!("    Error: {}", style(reason).red());
        }
        println!();
    }
}

pub async fn show_info(engine: &FluxEngine, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    let download = engine.get_download(id).await?;

    match format {
        OutputFormat::Json => print_json(&download)?,
        OutputFormat::Human => print_download_summary(&download, true),
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct SegmentRow {
                index: u32,
                range: String,
                written: String,
                state: String,
                retries: u32,
                error: String,
            }

            print_download_summary(&download, false);
            let rows: Vec<SegmentRow> = download
                .segments
                .iter()
                .map(|s| SegmentRow {
                    index: s.index,
                    range: if s.is_unknown_size() {
                        format!("{}-", s.start)
                    } else {
                        format!("{}-{}", s.start, s.end)
                    },
                    written: format_bytes(s.bytes_written),
                    state: s.state.to_string(),
                    retries: s.retry_count,
                    error: s.last_error.as_deref().map(|e| truncate(e, 40)).unwrap_or_default(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

pub async fn cancel_download(
    engine: &FluxEngine,
    id: &str,
    delete_partial: bool,
    _format: OutputFormat,
) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    let delete_partial = delete_partial || engine.config().delete_partial_on_cancel;
    engine.cancel_with(id, delete_partial).await?;
    println!("{} Download cancelled", style("✓").green().bold());
    Ok(())
}

pub async fn remove_download(
    engine: &FluxEngine,
    id: &str,
    with_file: bool,
    _format: OutputFormat,
) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    engine.remove(id, with_file).await?;
    println!("{} Download removed", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Probe Commands
// ============================================================================

#[derive(Serialize)]
struct ProbeRow {
    url: String,
    total_size: Option<u64>,
    supports_ranges: bool,
    final_url: Option<String>,
    error: Option<String>,
}

pub async fn probe_urls(engine: &FluxEngine, urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let results = engine.probe_many(&urls).await;
    let rows: Vec<ProbeRow> = urls
        .into_iter()
        .zip(results)
        .map(|(url, result)| match result {
            Ok(probe) => ProbeRow {
                url,
                total_size: probe.total_size,
                supports_ranges: probe.supports_ranges,
                final_url: Some(probe.final_url),
                error: None,
            },
            Err(e) => ProbeRow {
                url,
                total_size: None,
                supports_ranges: false,
                final_url: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    match format {
        OutputFormat::Json => print_json(&rows)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct LinkRow {
                url: String,
                size: String,
                resumable: String,
            }

            let table: Vec<LinkRow> = rows
                .iter()
                .map(|row| LinkRow {
                    url: truncate(&row.url, 50),
                    size: format_size(row.total_size),
                    resumable: match (&row.error, row.supports_ranges) {
                        (Some(_), _) => "error",
                        (None, true) => "Yes",
                        (None, false) => "No",
                    }
                    .to_string(),
                })
                .collect();

            println!("{}", Table::new(table));
        }
        OutputFormat::Human => {
            for row in &rows {
                if let Some(ref error) = row.error {
                    println!("{} {}: {}", style("✗").red(), row.url, style(error).red());
                    continue;
                }

                println!("{} {}", style("✓").green(), row.url);
                if let Some(ref final_url) = row.final_url {
                    if final_url != &row.url {
                        println!("    Redirects to: {}", final_url);
                    }
                }
                println!("    Size: {}", format_size(row.total_size));
                println!(
                    "    Resumable: {}",
                    if row.supports_ranges {
                        style("Yes").green()
                    } else {
                        style("No").yellow()
                    }
                );
            }
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    data_dir: &Path,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    let config = load_config(data_dir).await?;

    match action {
        None | Some(ConfigAction::Show) => match format {
            OutputFormat::Json => print_json(&config)?,
            _ => {
                println!("FluxDM Configuration ({}):", data_dir.display());
                println!();
                if let serde_json::Value::Object(map) = serde_json::to_value(&config)? {
                    for (key, value) in map {
                        println!("  {}: {}", key, value);
                    }
                }
            }
        },

        Some(ConfigAction::Get { key }) => {
            let value = config_value(&config, &key)?;
            println!("{}", value);
        }

        Some(ConfigAction::Set { key, value }) => {
            let updated = set_config_value(&config, &key, &value)?;
            save_config(data_dir, &updated).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                save_config(data_dir, &EngineConfig::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

fn config_value(config: &EngineConfig, key: &str) -> Result<serde_json::Value> {
    let serde_json::Value::Object(map) = serde_json::to_value(config)? else {
        bail!("config did not serialize to an object");
    };
    map.get(key)
        .cloned()
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))
}

/// Apply `key = value`, where value is a JSON literal or a bare string
fn set_config_value(config: &EngineConfig, key: &str, value: &str) -> Result<EngineConfig> {
    let serde_json::Value::Object(mut map) = serde_json::to_value(config)? else {
        bail!("config did not serialize to an object");
    };
    if !map.contains_key(key) {
        bail!("Unknown config key: {}", key);
    }

    let parsed = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    map.insert(key.to_string(), parsed);

    serde_json::from_value(serde_json::Value::Object(map))
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

// ============================================================================
// Helpers
// ============================================================================

/// Accept a full ID or an unambiguous prefix of one
async fn resolve_id(engine: &FluxEngine, id: &str) -> Result<DownloadId> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return Ok(uuid);
    }

    let matches: Vec<DownloadId> = engine
        .list()
        .await
        .iter()
        .map(|d| d.id)
        .filter(|candidate| candidate.to_string().starts_with(id))
        .collect();

    match matches.as_slice() {
        [single] => Ok(*single),
        [] => Err(anyhow!("No download matches {}", id)),
        _ => Err(anyhow!("{} is ambiguous ({} matches)", id, matches.len())),
    }
}

fn short_id(id: DownloadId) -> String {
    id.to_string()[..8].to_string()
}

/// Where to save `url`: an explicit file, a file inside an explicit
/// directory, or the URL's file name in the working directory
fn destination_for(url: &str, output: Option<PathBuf>) -> Result<PathBuf> {
    match output {
        Some(path) if !path.is_dir() => Ok(path),
        Some(dir) => Ok(dir.join(file_name_from_url(url))),
        None => {
            let cwd = std::env::current_dir().context("cannot determine working directory")?;
            Ok(cwd.join(file_name_from_url(url)))
        }
    }
}

fn file_name_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "download".to_string())
}
