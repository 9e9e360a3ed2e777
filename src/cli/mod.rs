//! CLI surface: a thin shell over the pipeline library.
//!
//! Argument parsing and config loading live here, outside the core; the
//! orchestrator only ever sees the finished `PipelineConfig` record.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::PipelineConfig;
use crate::pipeline::Orchestrator;
use crate::state::StateStore;

#[derive(Parser)]
#[command(name = "ratsgeo")]
#[command(about = "Turn OParl council documents into Parquet, RDF and GeoJSON")]
#[command(version)]
pub struct Cli {
    /// Config file path (YAML or TOML)
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for the configured city and time window
    Run {
        /// City to process (overrides config)
        #[arg(long)]
        city: Option<String>,

        /// Maximum number of papers to process
        #[arg(short, long)]
        limit: Option<usize>,

        /// Papers per batch for checkpointing
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Reprocess papers already completed in earlier runs
        #[arg(long)]
        no_skip_existing: bool,

        /// Move previously failed papers back to pending first
        #[arg(long)]
        reprocess_failed: bool,
    },

    /// Show state store statistics for recent runs
    Status,

    /// Reset failed papers of a run back to pending
    RetryFailed {
        /// Run id (defaults to the most recent run)
        #[arg(long)]
        run: Option<i64>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            city,
            limit,
            batch_size,
            no_skip_existing,
            reprocess_failed,
        } => {
            let mut config = PipelineConfig::load(&cli.config)
                .with_context(|| format!("loading config {}", cli.config.display()))?;
            if let Some(city) = city {
                config.city = city;
            }
            if let Some(limit) = limit {
                config.orchestrator.paper_limit = Some(limit);
            }
            if let Some(batch_size) = batch_size {
                config.orchestrator.batch_size = batch_size;
            }
            if no_skip_existing {
                config.orchestrator.skip_existing = false;
            }
            if reprocess_failed {
                config.orchestrator.reprocess_failed = true;
            }
            config.validate()?;

            run_pipeline(config).await
        }
        Commands::Status => {
            let config = PipelineConfig::load(&cli.config)
                .with_context(|| format!("loading config {}", cli.config.display()))?;
            show_status(&config)
        }
        Commands::RetryFailed { run } => {
            let config = PipelineConfig::load(&cli.config)
                .with_context(|| format!("loading config {}", cli.config.display()))?;
            retry_failed(&config, run)
        }
    }
}

async fn run_pipeline(config: PipelineConfig) -> anyhow::Result<()> {
    println!(
        "{} {} ({} - {})",
        style("Pipeline run:").bold(),
        style(&config.city).cyan(),
        config.api.window_start.date_naive(),
        config.api.window_end.date_naive()
    );

    let orchestrator = Orchestrator::new(config).context("initializing pipeline")?;

    // SIGINT finishes the current batch, checkpoints and exits cleanly.
    let stop = orchestrator.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStop requested - finishing current batch...");
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{elapsed}]").expect("spinner template"),
    );
    spinner.set_message("processing batches...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));

    let result = orchestrator.run().await;
    spinner.finish_and_clear();
    let stats = result.context("pipeline run failed")?;

    println!("\n{}", style("Run complete").green().bold());
    println!("  fetched:    {}", stats.papers_fetched);
    println!("  processed:  {}", style(stats.papers_processed).green());
    println!(
        "  failed:     {}",
        if stats.papers_failed > 0 {
            style(stats.papers_failed).red()
        } else {
            style(stats.papers_failed).dim()
        }
    );
    println!("  skipped:    {}", stats.papers_skipped);
    println!("  locations:  {}", stats.locations_extracted);
    println!("  geocoded:   {}", stats.locations_geocoded);
    Ok(())
}

fn show_status(config: &PipelineConfig) -> anyhow::Result<()> {
    let store = StateStore::open(&config.state_db_path())?;
    let runs = store.recent_runs(5)?;

    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!("{}", style("Recent runs").bold());
    for (run_id, city, status, started_at) in runs {
        let summary = store.summarize(run_id)?;
        let status_styled = match status.as_str() {
            "completed" => style(status.clone()).green(),
            "failed" => style(status.clone()).red(),
            _ => style(status.clone()).yellow(),
        };
        println!(
            "  #{} {} [{}] started {}",
            run_id, city, status_styled, started_at
        );
        println!(
            "      completed {} / failed {} / skipped {} / in-progress {}",
            summary.completed, summary.failed, summary.skipped, summary.in_progress
        );
    }
    Ok(())
}

fn retry_failed(config: &PipelineConfig, run: Option<i64>) -> anyhow::Result<()> {
    let store = StateStore::open(&config.state_db_path())?;
    let run_id = match run.or(store.latest_run_id()?) {
        Some(run_id) => run_id,
        None => {
            println!("No runs recorded yet.");
            return Ok(());
        }
    };

    let reset = store.reset_failed(run_id)?;
    println!(
        "Reset {} failed paper(s) of run #{} to pending",
        style(reset).cyan(),
        run_id
    );
    Ok(())
}
