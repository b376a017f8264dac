use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wikisync_storage::CheckpointStore;
use wikisync_sync::{checkpoint_status, report_recent_runs, SyncConfig, SyncMode, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "wikisync")]
#[command(about = "Incremental, resumable wiki mirror sync")]
struct Cli {
    /// YAML config file; `WIKISYNC_*` environment variables still override it.
    #[arg(long, global = true, env = "WIKISYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging for the sync crates.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync, resuming a compatible checkpoint if present.
    Sync {
        /// Ignore the baseline snapshot and refetch everything.
        #[arg(long)]
        full: bool,
        /// Stop scanning at the first changed page.
        #[arg(long)]
        fast_stop: bool,
        /// Detail fetches issued concurrently per batch.
        #[arg(long)]
        concurrency: Option<usize>,
        /// Serve the remote side from a JSON fixture wiki.
        #[arg(long)]
        fixture: Option<PathBuf>,
        #[arg(long)]
        export_parquet: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Describe the pending checkpoint, if any.
    Status,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("WIKISYNC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "wikisync=debug,info"
        } else {
            "wikisync=info,warn"
        })
    });

    let format = env::var("WIKISYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_yaml_file(&path)?.with_overrides(|name| env::var(name).ok()),
        None => SyncConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut config = load_config(cli.config)?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Sync {
            full,
            fast_stop,
            concurrency,
            fixture,
            export_parquet,
            json,
        } => {
            if full {
                config.mode = SyncMode::Full;
            }
            config.fast_stop |= fast_stop;
            config.export_parquet |= export_parquet;
            if let Some(width) = concurrency {
                config.detail_batch_width = width.max(1);
            }
            if fixture.is_some() {
                config.fixture_path = fixture;
            }
            info!(mode = %config.mode, data_dir = %config.data_dir.display(), "starting sync");

            let summary = SyncPipeline::from_config(config)?.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} mode={} scanned={} fetched={} votes_added={} \
                     snapshot={} reports={}",
                    summary.run_id,
                    summary.mode,
                    summary.stats.scanned,
                    summary.stats.payloads_fetched,
                    summary.stats.votes_added,
                    summary.snapshot_path,
                    summary.reports_dir
                );
            }
        }
        Commands::Status => {
            let store = CheckpointStore::new(config.checkpoint_path.clone());
            println!("{}", checkpoint_status(&store).await?);
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(runs, &config.reports_dir())?);
        }
    }

    Ok(())
}
