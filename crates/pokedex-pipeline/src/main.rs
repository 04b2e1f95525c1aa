//! Pokedex Pipeline - batch ETL from the catalog API into Postgres

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pokedex_common::logging::{init_logging, LogConfig, LogLevel};
use pokedex_pipeline::{Orchestrator, PipelineConfig, PipelineError, RunReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pokedex-pipeline")]
#[command(author, version, about = "Batch ETL of the Pokédex catalog into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Environment file to load instead of `./.env`
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List, fetch and stage every entry, provision the sink, then load
    Run {
        /// Number of catalog entries to ingest
        #[arg(short, long)]
        limit: Option<u32>,

        /// Maximum concurrent detail requests
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Staging directory
        #[arg(short, long)]
        staging_path: Option<PathBuf>,
    },

    /// Provision the sink and load what is already staged
    Load {
        /// Staging directory
        #[arg(short, long)]
        staging_path: Option<PathBuf>,
    },

    /// Print the effective configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    load_env_file(cli.env_file.as_deref())?;
    let _log_guard = init_logging(&log_config(cli.verbose)?)?;

    let mut config = PipelineConfig::load().context("Failed to load pipeline configuration")?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(ExitCode::SUCCESS)
        },
        Command::Run {
            limit,
            concurrency,
            staging_path,
        } => {
            if let Some(limit) = limit {
                config.source.catalog_limit = limit;
            }
            if let Some(concurrency) = concurrency {
                config.fetch.concurrency = concurrency;
            }
            if let Some(path) = staging_path {
                config.staging.path = path;
            }

            let orchestrator = Orchestrator::from_config(&config)?;
            cancel_on_ctrl_c(&orchestrator);

            info!(
                limit = config.source.catalog_limit,
                concurrency = config.fetch.concurrency,
                staging = %config.staging.path.display(),
                "Starting pipeline run"
            );
            Ok(finish(orchestrator.run().await))
        },
        Command::Load { staging_path } => {
            if let Some(path) = staging_path {
                config.staging.path = path;
            }

            let orchestrator = Orchestrator::from_config(&config)?;
            cancel_on_ctrl_c(&orchestrator);

            info!(staging = %config.staging.path.display(), "Starting load-only run");
            Ok(finish(orchestrator.run_load_only().await))
        },
    }
}

/// Load the environment file before anything reads `LOG_*` or pipeline
/// variables; variables already set in the process win
fn load_env_file(path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
        },
        None => {
            dotenvy::dotenv().ok();
        },
    }
    Ok(())
}

/// Logging config from the verbosity flag; `LOG_*` variables take precedence
fn log_config(verbose: bool) -> Result<LogConfig> {
    let level = if verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let config = LogConfig::builder()
        .level(level)
        .log_file_prefix("pokedex-pipeline")
        .build()
        .merge_env()?;
    Ok(config)
}

fn cancel_on_ctrl_c(orchestrator: &Orchestrator) {
    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });
}

fn finish(outcome: Result<RunReport, PipelineError>) -> ExitCode {
    match outcome {
        Ok(report) => {
            let elapsed = report.finished_at - report.started_at;
            info!(
                run_id = %report.run_id,
                references = report.references_listed,
                staged = report.documents_staged,
                rows = report.rows_loaded,
                elapsed_ms = elapsed.num_milliseconds(),
                "Pipeline run succeeded"
            );
            ExitCode::SUCCESS
        },
        Err(e) => {
            let failed_tasks: Vec<String> = e.failed_tasks().iter().map(ToString::to_string).collect();
            error!(
                stage = %e.stage(),
                failed_tasks = ?failed_tasks,
                failed_entity_ids = ?e.failed_entity_ids(),
                error = %e,
                "Pipeline run failed"
            );
            ExitCode::FAILURE
        },
    }
}
