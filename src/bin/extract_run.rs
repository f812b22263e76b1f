//! Pipeline stage CLI
//!
//! Runs the whole pipeline, or any single stage as a stateless worker, and
//! prints JSON to stdout.
//!
//! Usage:
//!   cargo run --bin extract_run -- windows
//!   cargo run --bin extract_run -- discover
//!   cargo run --bin extract_run -- extract --run-id r1 --symbol BTCUSDT_UMCBL
//!   cargo run --bin extract_run -- collect --run-id r1
//!   cargo run --bin extract_run -- run --symbols BTCUSDT_UMCBL,ETHUSDT_UMCBL --output result.json

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use bitget_orders_backend::{
    config::{BlobBackend, PipelineConfig},
    load_env,
    pipeline::{horizon_ending_at, new_run_id, partition, PipelineCoordinator, RunControl, RunRequest},
    scrapers::{BitgetCredentials, BitgetRestClient},
    storage::open_blob_store,
};

#[derive(Parser, Debug)]
#[command(name = "extract_run")]
#[command(about = "Extract historical Bitget futures orders")]
struct Args {
    /// TOML config file (defaults to ORDERS_CONFIG_PATH / orders_config.toml)
    #[arg(long, env = "ORDERS_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the blob store root directory
    #[arg(long, env = "ORDERS_BLOB_ROOT")]
    blob_root: Option<PathBuf>,

    /// Override the lookback horizon in days
    #[arg(long)]
    lookback_days: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the discovery windows for the current horizon
    Windows,

    /// Discover and rank traded symbols
    Discover,

    /// Extract one symbol into blob storage
    Extract {
        #[arg(long)]
        run_id: String,

        #[arg(long)]
        symbol: String,
    },

    /// Merge every symbol blob of a run into the final result
    Collect {
        #[arg(long)]
        run_id: String,

        /// Write the full result here instead of printing a summary
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run the full pipeline
    Run {
        /// Comma-separated symbols; skips discovery
        #[arg(long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,

        #[arg(long)]
        run_id: Option<String>,

        /// Write the full result here instead of printing a summary
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "extract_run=info,bitget_orders_backend=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    if let Commands::Windows = args.command {
        let horizon = horizon_ending_at(Utc::now().timestamp_millis(), config.horizon.lookback_ms())?;
        let windows = partition(horizon.start, horizon.end, config.horizon.window_ms())?;
        println!("{}", serde_json::to_string_pretty(&windows)?);
        return Ok(());
    }

    let creds = BitgetCredentials::from_env()
        .context("BITGET_API_KEY, BITGET_SECRET_KEY and BITGET_PASSPHRASE must be set")?;
    let source = BitgetRestClient::new(creds, &config.exchange)?;
    let store = open_blob_store(&config.storage)?;
    let coordinator = PipelineCoordinator::new(config, Arc::new(source), store);

    match args.command {
        Commands::Windows => {}
        Commands::Discover => {
            let horizon = coordinator.current_horizon()?;
            let report = coordinator.discover_symbols(&horizon).await?;
            println!("{}", serde_json::to_string_pretty(&report.unified)?);
            if !report.failed.is_empty() {
                eprintln!("{} discovery windows failed", report.failed.len());
            }
        }
        Commands::Extract { run_id, symbol } => {
            let horizon = coordinator.current_horizon()?;
            let mut results = coordinator.extract_symbols(&run_id, &horizon, vec![symbol]).await;
            let Some(result) = results.pop() else {
                bail!("extraction produced no result");
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Collect { run_id, output } => {
            let result = coordinator.collect_run(&run_id, None).await?;
            let key = coordinator.persist_result(&run_id, &result).await?;
            write_output(output, &result)?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "result_key": key,
                "summary": result.summary(),
            }))?);
        }
        Commands::Run { symbols, run_id, output } => {
            let request = RunRequest {
                run_id: run_id.unwrap_or_else(new_run_id),
                horizon: None,
                symbols,
            };
            let run = coordinator.run(request, &RunControl::new()).await?;
            write_output(output, &run.result)?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "run_id": run.run_id,
                "result_key": run.result_key,
                "summary": run.result.summary(),
            }))?);
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let default_path = PathBuf::from("orders_config.toml");
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None if default_path.exists() => PipelineConfig::load(&default_path)?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides();

    if let Some(root) = &args.blob_root {
        config.storage.backend = BlobBackend::Filesystem;
        config.storage.root = root.clone();
    }
    if let Some(days) = args.lookback_days {
        config.horizon.lookback_days = days;
    }

    config.validate()?;
    Ok(config)
}

fn write_output<T: serde::Serialize>(output: Option<PathBuf>, value: &T) -> Result<()> {
    if let Some(path) = output {
        let bytes = serde_json::to_vec_pretty(value)?;
        std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("Wrote {}", path.display());
    }
    Ok(())
}
