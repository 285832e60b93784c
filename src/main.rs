//! # tender-watch CLI (`tw`)
//!
//! ## Usage
//!
//! ```bash
//! tw --config ./config/tw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tw init` | Create the notice store schema |
//! | `tw tasks` | List configured tasks and whether their inputs exist |
//! | `tw run --regime 44\|223` | Search, reconcile and append new notices |
//! | `tw reconcile --regime 44\|223 <file>` | Print the lines of a file the store has not seen |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use tender_watch::config::{self, Config};
use tender_watch::migrate;
use tender_watch::models::{MatchPolicy, Regime, SearchMode};
use tender_watch::progress::ProgressMode;
use tender_watch::run::{self, RunOptions};

/// tender-watch: finds newly published procurement notices.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tw.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "tw",
    about = "tender-watch: finds newly published procurement notices",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tw.toml")]
    config: PathBuf,

    /// Progress on stderr. Defaults to human when stderr is a terminal.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the notice store schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// List configured tasks.
    Tasks,

    /// Run every task of a regime.
    ///
    /// Each task's inputs are split across browser sessions; new notices
    /// are appended to the task's output file.
    Run {
        /// Procurement regime: 44 or 223.
        #[arg(long, value_enum)]
        regime: Regime,

        /// Only run tasks of this mode.
        #[arg(long, value_enum)]
        mode: Option<SearchMode>,

        /// Publication window in days, ending today.
        #[arg(long)]
        days: Option<u32>,

        /// How keyword phrases combine.
        #[arg(long = "match", value_enum)]
        match_policy: Option<MatchPolicy>,

        /// Number of parallel browser sessions.
        #[arg(long)]
        workers: Option<usize>,

        /// Show the browser windows.
        #[arg(long)]
        visible: bool,
    },

    /// Print the lines of a collected file the store has not seen.
    Reconcile {
        /// Procurement regime: 44 or 223.
        #[arg(long, value_enum)]
        regime: Regime,

        /// File with one collected notice per line.
        file: PathBuf,
    },
}

fn init_tracing(cfg: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log.level))
        .with_context(|| format!("Invalid log level: '{}'", cfg.log.level))?;

    match &cfg.log.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Notice store initialized successfully.");
        }
        Commands::Tasks => {
            run::list_tasks(&cfg);
        }
        Commands::Run {
            regime,
            mode,
            days,
            match_policy,
            workers,
            visible,
        } => {
            let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
            let options = RunOptions {
                regime,
                mode,
                days,
                match_policy,
                workers,
                visible,
            };
            run::run_search(&cfg, &options, progress.reporter().as_ref()).await?;
        }
        Commands::Reconcile { regime, file } => {
            run::run_reconcile(&cfg, regime, &file).await?;
        }
    }

    Ok(())
}
