//! Thin command surface over the trip pipeline.
//!
//! The transport layer stays out of the pipeline's way: every command opens
//! the store, invokes one pipeline operation, and prints JSON to stdout. The
//! `ingest` command additionally streams run events as line-delimited JSON
//! while the pipeline executes on a worker thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use trip_pipeline_core::{EventBus, PipelineError, RunStatus};
use trip_pipeline_store_sqlite::{execute_run, trigger_run, BoundingBox, SqliteTripStore};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "trips")]
#[command(about = "Trip ingestion and weekly analytics")]
pub struct Cli {
    #[arg(long, default_value = "./trips.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest a trip source file and stream run events until the run ends.
    Ingest(IngestArgs),
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    /// List the distinct regions present in raw storage.
    Regions,
    Analytics {
        #[command(subcommand)]
        command: AnalyticsCommand,
    },
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Path to the delimited trip source file.
    source: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    /// Show the full record of one ingestion run.
    Show(RunShowArgs),
}

#[derive(Debug, Args)]
pub struct RunShowArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Subcommand)]
pub enum AnalyticsCommand {
    /// Weekly trip-count statistics for a region inside a bounding box.
    WeeklyAverage(WeeklyAverageArgs),
}

#[derive(Debug, Args)]
pub struct WeeklyAverageArgs {
    #[arg(long)]
    region: String,
    #[arg(long, allow_hyphen_values = true)]
    min_lat: f64,
    #[arg(long, allow_hyphen_values = true)]
    min_lng: f64,
    #[arg(long, allow_hyphen_values = true)]
    max_lat: f64,
    #[arg(long, allow_hyphen_values = true)]
    max_lng: f64,
}

/// Dispatches a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the store cannot be opened or the invoked pipeline
/// operation fails; a failed ingestion run also surfaces here after the
/// terminal event has been printed.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ingest(args) => run_ingest(&cli.db, &args),
        Command::Runs { command } => match command {
            RunsCommand::Show(args) => run_show(&cli.db, &args),
        },
        Command::Regions => {
            let store = open_store(&cli.db)?;
            let regions = store.list_regions()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "regions": regions }))?
            );
            Ok(())
        }
        Command::Analytics { command } => match command {
            AnalyticsCommand::WeeklyAverage(args) => run_weekly_average(&cli.db, &args),
        },
    }
}

fn open_store(db: &Path) -> Result<SqliteTripStore> {
    let store = SqliteTripStore::open(db)?;
    store.migrate()?;
    Ok(store)
}

fn run_ingest(db: &Path, args: &IngestArgs) -> Result<()> {
    let store = open_store(db)?;
    let run_id = trigger_run(&store, &args.source)?;
    drop(store);

    println!(
        "{}",
        serde_json::to_string(&json!({
            "run_id": run_id.to_string(),
            "status": RunStatus::Queued.as_str(),
        }))?
    );

    let bus = Arc::new(EventBus::new());
    let observer = bus.subscribe(run_id);

    let worker_bus = Arc::clone(&bus);
    let worker_db = db.to_path_buf();
    let source = args.source.clone();
    let worker = thread::spawn(move || -> Result<u64> {
        let mut store = SqliteTripStore::open(&worker_db)?;
        execute_run(&mut store, &worker_bus, run_id, &source)
    });

    loop {
        match observer.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                println!("{}", serde_json::to_string(&event)?);
                if event.status.is_terminal() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if worker.is_finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    match worker.join() {
        Ok(result) => {
            let _ = result?;
            Ok(())
        }
        Err(_) => Err(anyhow!("ingestion worker panicked")),
    }
}

fn run_show(db: &Path, args: &RunShowArgs) -> Result<()> {
    let run_id = Ulid::from_string(&args.run_id)
        .with_context(|| format!("invalid run id: {}", args.run_id))?;

    let store = open_store(db)?;
    let Some(run) = store.get_run(run_id)? else {
        return Err(PipelineError::UnknownRun(args.run_id.clone()).into());
    };

    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

fn run_weekly_average(db: &Path, args: &WeeklyAverageArgs) -> Result<()> {
    let store = open_store(db)?;
    let report = store.weekly_average(
        &args.region,
        BoundingBox {
            min_lat: args.min_lat,
            min_lng: args.min_lng,
            max_lat: args.max_lat,
            max_lng: args.max_lng,
        },
    )?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
