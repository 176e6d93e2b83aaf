//! FluxDM CLI - Command-line download manager
//!
//! Drives the FluxDM engine: segmented downloads with pause/resume that
//! survive restarts.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use fluxdm_core::{FluxEngine, StoreKind};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// FluxDM - Resumable multi-connection downloader
#[derive(Parser)]
#[command(name = "fluxdm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding the download database and config
    #[arg(long, env = "FLUXDM_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Where resume tokens are kept
    #[arg(long, env = "FLUXDM_STORE", default_value = "sqlite", global = true)]
    store: Store,

    /// Speed ceiling across all downloads, in bytes/sec
    #[arg(long, env = "FLUXDM_GLOBAL_LIMIT", global = true)]
    global_limit: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Store {
    /// SQLite database in the data directory
    Sqlite,
    /// One JSON document per download
    Json,
}

impl From<Store> for StoreKind {
    fn from(store: Store) -> Self {
        match store {
            Store::Sqlite => StoreKind::Sqlite,
            Store::Json => StoreKind::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL
    Get(GetArgs),

    /// Resume a paused download
    Resume {
        /// Download ID (or unique prefix)
        id: String,
    },

    /// List downloads
    List {
        /// Filter by state (running, paused, completed, ...)
        #[arg(short, long)]
        state: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show download info
    Info {
        /// Download ID (or unique prefix)
        id: String,
    },

    /// Cancel a paused download
    Cancel {
        /// Download ID (or unique prefix)
        id: String,

        /// Also delete the partial file
        #[arg(long)]
        delete_partial: bool,
    },

    /// Forget a paused or finished download
    Remove {
        /// Download ID (or unique prefix)
        id: String,

        /// Also delete the downloaded file
        #[arg(long)]
        with_file: bool,
    },

    /// Probe URLs for size and range support
    Probe {
        /// URLs to probe
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show/update engine configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
pub struct GetArgs {
    /// URL to download
    url: String,

    /// Output file or directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum parallel connections
    #[arg(short, long, env = "FLUXDM_CONNECTIONS")]
    connections: Option<u32>,

    /// Minimum segment size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Attempts per segment before it fails
    #[arg(long)]
    retries: Option<u32>,

    /// Speed limit for this download, in bytes/sec
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value (JSON literal or plain string)
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "fluxdm_core=debug" } else { "fluxdm_core=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("fluxdm"))
            .unwrap_or_else(|| PathBuf::from(".fluxdm"))
    });

    match cli.command {
        Commands::Config { action } => {
            return commands::config_action(&data_dir, action, cli.output).await;
        }
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "fluxdm", &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let mut config = fluxdm_core::load_config(&data_dir).await?;
    if cli.global_limit.is_some() {
        config.global_speed_limit = cli.global_limit.filter(|l| *l > 0);
    }

    // Initialize engine and bring back downloads from earlier runs
    let engine = FluxEngine::open_with_store(data_dir, config, cli.store.into()).await?;
    engine.restore(false).await?;

    let result = match cli.command {
        Commands::Get(args) => commands::get(&engine, args, cli.output).await,

        Commands::Resume { id } => commands::resume(&engine, &id, cli.output).await,

        Commands::List { state, all } => {
            commands::list_downloads(&engine, state, all, cli.output).await
        }

        Commands::Info { id } => commands::show_info(&engine, &id, cli.output).await,

        Commands::Cancel { id, delete_partial } => {
            commands::cancel_download(&engine, &id, delete_partial, cli.output).await
        }

        Commands::Remove { id, with_file } => {
            commands::remove_download(&engine, &id, with_file, cli.output).await
        }

        Commands::Probe { urls } => commands::probe_urls(&engine, urls, cli.output).await,

        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    };

    engine.shutdown().await;
    result
}
