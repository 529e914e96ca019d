//! redolog - Redo log tooling for change-data-capture changefeeds
//!
//! Inspects, verifies, replays and garbage-collects a changefeed's redo log.

use clap::{Parser, Subcommand};
use redolog_wal::{
    repair_segments, verify_segments, CancellationToken, LogMeta, LogReader, MetaPersister,
    RedoConfig, RedoLog, RetentionController, StorageUri,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "redolog")]
#[command(about = "Inspect and replay the redo log of a changefeed")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "REDO_CONFIG")]
    config: Option<PathBuf>,

    /// Redo directory (overrides the configuration)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Changefeed identity (overrides the configuration)
    #[arg(long)]
    changefeed: Option<String>,

    /// External storage URI, e.g. file:///mnt/redo (overrides the configuration)
    #[arg(long)]
    storage_uri: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the checkpoint and resolved timestamps
    Meta,

    /// Print records in [start, end) as JSON lines, DDL first
    Replay {
        /// Inclusive lower commit-ts bound
        #[arg(long)]
        start: u64,

        /// Exclusive upper commit-ts bound
        #[arg(long)]
        end: u64,

        /// Records fetched per read
        #[arg(long, default_value_t = 256)]
        batch: usize,
    },

    /// Scan every segment and report corruption
    Verify {
        /// Truncate torn tails
        #[arg(long)]
        repair: bool,
    },

    /// Delete closed segments below a checkpoint
    Gc {
        /// Checkpoint ts to collect below (defaults to the persisted checkpoint)
        #[arg(long)]
        checkpoint: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = RedoConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.dir {
        config.dir = dir;
    }
    if let Some(changefeed) = cli.changefeed {
        config.changefeed_id = changefeed;
    }
    if let Some(uri) = cli.storage_uri {
        config.storage_uri = Some(uri);
    }
    config.validate()?;

    // Ctrl-C cancels whatever is in progress
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling");
                token.cancel();
            }
        });
    }

    match cli.command {
        Commands::Meta => {
            let reader = LogReader::new(config.reader_config())?;
            let meta = reader.read_log_meta(&token)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }

        Commands::Replay { start, end, batch } => {
            let mut reader = LogReader::new(config.reader_config())?;
            reader.reset_reader(&token, start, end)?;

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let batch = batch.max(1);
            let mut total = 0usize;

            loop {
                let ddls = reader.read_next_ddl(&token, batch)?;
                let done = ddls.len() < batch;
                for ddl in ddls {
                    writeln!(out, "{}", serde_json::to_string(&RedoLog::Ddl(ddl))?)?;
                    total += 1;
                }
                if done {
                    break;
                }
            }
            loop {
                let rows = reader.read_next_log(&token, batch)?;
                let done = rows.len() < batch;
                for row in rows {
                    writeln!(out, "{}", serde_json::to_string(&RedoLog::Row(row))?)?;
                    total += 1;
                }
                if done {
                    break;
                }
            }

            reader.close()?;
            tracing::info!("Replayed {} records from [{}, {})", total, start, end);
        }

        Commands::Verify { repair } => {
            let result = if repair {
                repair_segments(&config.dir)?
            } else {
                verify_segments(&config.dir)?
            };

            println!("Segments:       {}", result.segments.len());
            println!("Valid records:  {}", result.valid_records);
            println!("Invalid bytes:  {}", result.bytes_invalid);
            println!("Max commit ts:  {}", result.max_commit_ts);
            for (path, problem) in &result.segments_with_errors {
                println!("  {}: {}", path.display(), problem);
            }

            if !result.is_clean() && !repair {
                return Err(format!(
                    "{} segments have errors",
                    result.segments_with_errors.len()
                )
                .into());
            }
        }

        Commands::Gc { checkpoint } => {
            let storage = match &config.storage_uri {
                Some(uri) => Some(StorageUri::parse(uri)?.open()?),
                None => None,
            };
            let (name, meta) = LogMeta::load_latest(&config.dir, &config.changefeed_id)?;
            let meta = Arc::new(MetaPersister::new(&config.dir, name, meta, storage.clone()));
            if let Some(ts) = checkpoint {
                meta.set_checkpoint_ts(ts);
            }

            let controller =
                RetentionController::new(&config.dir, &config.changefeed_id, meta, storage);
            let report = controller.tick()?;
            println!(
                "Deleted {} segments below checkpoint {} (gc_ts={})",
                report.deleted.len(),
                report.checkpoint_ts,
                report.gc_ts
            );
            report.into_result()?;
        }
    }

    Ok(())
}
