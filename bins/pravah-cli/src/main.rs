//! # Pravah CLI - Job Runner
//!
//! Executes a single engine job described by a JSON JobSpec file against
//! either file-backed buckets (a local directory per bucket) or S3 with
//! credentials from the environment.
//!
//! ```bash
//! # Run against ./data/<bucket>/<key>
//! pravah-cli --job job.json
//!
//! # Run against S3 (AWS_* environment variables supply credentials)
//! pravah-cli --job job.json --s3
//!
//! # Debug logging
//! RUST_LOG=debug pravah-cli --job job.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pravah_core::{EngineOptions, JobSpec, JobState};
use pravah_engine::{Engine, MemoryCache, StartOutcome};
use pravah_io::{LocalStores, S3Stores, StoreProvider};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the Pravah job runner.
#[derive(Parser, Debug)]
#[command(name = "pravah-cli")]
#[command(about = "Streaming data-processing job runner")]
struct Args {
    /// Path to the JSON job specification file
    #[arg(short, long)]
    job: PathBuf,

    /// Root directory for file-backed buckets (one subdirectory per bucket)
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Use S3 buckets with credentials and region from the environment
    #[arg(long)]
    s3: bool,

    /// Progress reporting interval in milliseconds
    #[arg(long, default_value_t = 500)]
    progress_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let spec: JobSpec = {
        let raw = std::fs::read_to_string(&args.job)
            .with_context(|| format!("read {}", args.job.display()))?;
        serde_json::from_str(&raw).context("parse job spec")?
    };

    let stores: Arc<dyn StoreProvider> = if args.s3 {
        Arc::new(S3Stores)
    } else {
        Arc::new(LocalStores::new(&args.data_dir))
    };
    let engine = Arc::new(Engine::new(
        stores,
        Arc::new(MemoryCache::new()),
        EngineOptions::from_env(),
    ));

    let outcome = engine.start(spec).await?;
    let id = match &outcome {
        StartOutcome::CacheHit {
            output_location, ..
        } => {
            println!("cache hit: {output_location}");
            return Ok(());
        }
        StartOutcome::Started(id) | StartOutcome::Attached(id) => *id,
    };

    let printer = {
        let engine = engine.clone();
        let interval = Duration::from_millis(args.progress_ms.max(50));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Ok(run) = engine.progress(id) else { break };
                if run.state.is_terminal() {
                    break;
                }
                let p = run.progress;
                eprintln!(
                    "{}: {:?} in={}B/{}rows out={}rows/{}B",
                    id, run.state, p.bytes_in, p.rows_in, p.rows_out, p.bytes_out
                );
            }
        })
    };

    let run = tokio::select! {
        run = engine.await_run(id) => run?,
        _ = signal::ctrl_c() => {
            eprintln!("\ninterrupted; cancelling {id}");
            engine.cancel(id)?;
            engine.await_run(id).await?
        }
    };
    printer.abort();

    println!("{}", serde_json::to_string_pretty(&run)?);
    match run.state {
        JobState::Succeeded => Ok(()),
        JobState::Cancelled => {
            std::process::exit(130);
        }
        _ => {
            std::process::exit(1);
        }
    }
}
