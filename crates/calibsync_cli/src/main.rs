//! `calibsync` command-line entry point.
//!
//! # Responsibility
//! - Open the local store and route each subcommand through the core crate.
//! - Print summaries for humans and snapshots/statistics as JSON.

use anyhow::{anyhow, bail, Context, Result};
use calibsync_core::{
    default_log_level, init_logging, open_db, CancelToken, ExternalId, HttpListSource,
    InstrumentStatus, JsonFileSource, ReconciliationStore, SessionRepository,
    SqliteReconciliationStore, StatisticsEngine, SyncConfig, SyncOrchestrator,
};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "calibsync", version)]
#[command(about = "Mirror a remote instrument list into a local calibration store")]
struct Cli {
    /// SQLite database file, created and migrated on first use
    #[arg(long, global = true, default_value = "calibsync.db")]
    db: PathBuf,

    /// Absolute directory for rolling log files; logging is off when omitted
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// JSON sync configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync session against a JSON export or the list service
    Sync {
        /// JSON file holding the remote instrument list
        #[arg(long, conflicts_with = "url")]
        source: Option<PathBuf>,

        /// List service endpoint; overrides `http.url` from the config
        #[arg(long)]
        url: Option<String>,
    },

    /// List recent sessions, newest first
    Sessions {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Print due-date statistics as JSON
    Stats {
        /// Reference date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },

    /// Print every stored instrument as JSON
    Snapshot,

    /// Write an online backup of the database
    Backup {
        /// Destination file; must not exist
        #[arg(long)]
        dest: PathBuf,
    },

    /// Set a manual status that is flagged as a local override
    SetStatus {
        #[arg(long)]
        external_id: String,

        /// active, in_maintenance or retired
        #[arg(long)]
        status: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(log_dir) = &cli.log_dir {
        let level = cli.log_level.as_deref().unwrap_or(default_log_level());
        init_logging(level, log_dir).context("failed to initialize logging")?;
    }

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("failed to load config `{}`", path.display()))?,
        None => SyncConfig::default(),
    };
    let conn = open_db(&cli.db)
        .with_context(|| format!("failed to open database `{}`", cli.db.display()))?;
    let store = SqliteReconciliationStore::try_new(&conn).context("database is not usable")?;
    let max_summary_errors = config.max_summary_errors;
    let http = config.http.clone();
    let orchestrator = SyncOrchestrator::new(config);

    match cli.command {
        Commands::Sync { source, url } => {
            let cancel = CancelToken::new();
            let session = match (source, url.or(http.url.clone())) {
                (Some(path), _) => orchestrator.run(&store, &JsonFileSource::new(&path), &cancel),
                (None, Some(url)) => {
                    let auth = http.auth().context("http credentials are not usable")?;
                    let source = HttpListSource::with_options(url, auth, http.options())
                        .context("cannot create http source")?;
                    orchestrator.run(&store, &source, &cancel)
                }
                (None, None) => {
                    bail!("sync needs --source, --url or `http.url` in the config")
                }
            }
            .context("sync session could not run")?;
            println!("{}", session.summary(max_summary_errors));
        }
        Commands::Sessions { limit } => {
            let sessions = store
                .list_sessions(limit)
                .context("failed to list sessions")?;
            if sessions.is_empty() {
                println!("no sessions recorded");
            }
            for session in sessions {
                println!("{}\n", session.summary(max_summary_errors));
            }
        }
        Commands::Stats { as_of } => {
            let as_of = as_of.unwrap_or_else(|| Local::now().date_naive());
            let snapshot = store.snapshot().context("failed to read snapshot")?;
            let stats = StatisticsEngine::compute(&snapshot, as_of);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Snapshot => {
            let snapshot = store.snapshot().context("failed to read snapshot")?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Backup { dest } => {
            orchestrator
                .run_backup(&store, &dest)
                .with_context(|| format!("backup to `{}` failed", dest.display()))?;
            info!("event=backup module=cli status=ok dest={}", dest.display());
            println!("backup written to {}", dest.display());
        }
        Commands::SetStatus {
            external_id,
            status,
        } => {
            let external_id = ExternalId::parse(&external_id)
                .map_err(|err| anyhow!("invalid external id: {err}"))?;
            let Some(status) = InstrumentStatus::parse(&status) else {
                bail!("unknown status `{status}`; expected active, in_maintenance or retired");
            };
            let instrument = orchestrator
                .set_manual_status(&store, &external_id, status)
                .with_context(|| format!("failed to set status on {external_id}"))?;
            println!(
                "{} status={} revision={}",
                instrument.external_id, instrument.status, instrument.revision
            );
        }
    }
    Ok(())
}
