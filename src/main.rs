//! test-fanout - Parallel test discovery and execution
//!
//! A CLI tool that fans test discovery and test runs out over a pool of
//! isolated workers and merges what they report into a single outcome.
//!
//! ## Features
//!
//! - Sources grouped into workloads by the runtime that can host them
//! - Sequential or parallel scheduling with a bounded worker pool
//! - Exactly one aggregated completion per operation, even when stopped
//! - Per-source discovery status (fully, partially, not discovered, skipped)
//! - Graceful cancel on Ctrl-C and an optional session timeout
//! - Stored runs with JSON and CSV export
//!
//! ## Usage
//!
//! ```bash
//! # List the tests in two manifests
//! test-fanout discover suites/math.yaml suites/io.yaml
//!
//! # Run every manifest on up to 8 workers and keep the results
//! test-fanout run suites/*.yaml --parallel --workers 8 --save
//!
//! # Export the most recent run
//! test-fanout results --latest --export last.csv
//! ```

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod cli;
mod config;
mod events;
mod executor;
mod models;
mod output;
mod results;
mod utils;
mod worker;

use cli::{Args, OperationArgs};
use config::{AppConfig, EnvConfig};
use events::{DiscoveryEvent, RunEvent};
use executor::{ParallelDiscoveryManager, ParallelExecutionManager};
use models::{DiscoveryCriteria, RunCriteria, RunTarget};
use output::{OutputFormat, ResultFormatter};
use results::{ExportFormat, ResultsStorage, StoredRun};
use utils::{init_logger, LogLevel};
use worker::{ManifestResolver, ManifestWorker};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let env = EnvConfig::load();
    let config_path = args
        .config
        .clone()
        .or_else(|| env.config_file.as_ref().map(PathBuf::from));
    let mut config = AppConfig::load_or_default(config_path.as_deref())?;
    config.apply_env(&env);

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        config.log_level()
    };
    init_logger(level);

    match args.command {
        cli::Command::Discover(discover_args) => discover(discover_args, config).await,
        cli::Command::Run(run_args) => run(run_args, config).await,
        cli::Command::Results(results_args) => show_results(results_args, &config),
        cli::Command::Config(config_args) => manage_config(config_args, &config, &env),
    }
}

/// Overlay command-line flags on the loaded configuration
fn apply_operation_args(mut config: AppConfig, args: &OperationArgs) -> Result<AppConfig> {
    if args.parallel {
        config.parallel = true;
    }
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if let Some(timeout) = args.timeout {
        config.session_timeout_secs = Some(timeout);
    }
    if let Some(format) = &args.format {
        config.format = format.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn discover(args: cli::DiscoverArgs, config: AppConfig) -> Result<ExitCode> {
    let config = apply_operation_args(config, &args.operation)?;
    let formatter = ResultFormatter::new(config.output_format());

    let manager = ParallelDiscoveryManager::new(
        ManifestWorker::factory(),
        Arc::new(ManifestResolver::new()),
        config.parallel_options(),
    )?;

    let mut criteria = DiscoveryCriteria::new(args.operation.sources.clone())
        .with_chunk_size(config.discovery_chunk_size)
        .parallel(config.parallel);
    if let Some(filter) = &args.operation.filter {
        criteria = criteria.with_filter(filter);
    }
    if let Some(timeout) = config.session_timeout() {
        criteria = criteria.with_timeout(timeout);
    }

    info!(
        "Discovering tests in {} sources (parallel: {})",
        criteria.sources.len(),
        criteria.parallel
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.discover(criteria, Arc::new(tx)).await;

    let mut tests = Vec::new();
    let mut interrupted = false;
    let complete = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(DiscoveryEvent::TestsDiscovered(chunk)) => {
                    if formatter.format().is_streaming() {
                        for test in &chunk {
                            println!("{}", formatter.format_test_case(test));
                        }
                    }
                    tests.extend(chunk);
                }
                Some(DiscoveryEvent::Message(message)) => {
                    eprintln!("{}", formatter.format_message(&message));
                }
                Some(DiscoveryEvent::Complete(complete)) => break complete,
                None => return Err(anyhow!("Discovery ended without a completion")),
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, canceling discovery");
                manager.cancel().await;
            }
        }
    };

    manager.close().await;
    println!("{}", formatter.format_discovery(&tests, &complete));

    Ok(if complete.is_aborted {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn run(args: cli::RunArgs, config: AppConfig) -> Result<ExitCode> {
    let config = apply_operation_args(config, &args.operation)?;
    let formatter = ResultFormatter::new(config.output_format());

    let manager = ParallelExecutionManager::new(
        ManifestWorker::factory(),
        Arc::new(ManifestResolver::new()),
        config.parallel_options(),
    )?;

    let sources = args.operation.sources.clone();
    let mut criteria = RunCriteria::new(RunTarget::Sources(sources.clone()))
        .with_stats_frequency(config.stats_frequency)
        .parallel(config.parallel);
    if let Some(filter) = &args.operation.filter {
        criteria = criteria.with_filter(filter);
    }
    if let Some(timeout) = config.session_timeout() {
        criteria = criteria.with_timeout(timeout);
    }

    info!(
        "Running tests in {} sources (parallel: {})",
        sources.len(),
        criteria.parallel
    );

    let started_at = Utc::now();
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.run(criteria, Arc::new(tx)).await;

    let mut results = Vec::new();
    let mut interrupted = false;
    let complete = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(RunEvent::Progress(progress)) => {
                    if formatter.format().is_streaming() {
                        for result in &progress.new_results {
                            println!("{}", formatter.format_result(result));
                        }
                    }
                    results.extend(progress.new_results);
                }
                Some(RunEvent::Message(message)) => {
                    eprintln!("{}", formatter.format_message(&message));
                }
                Some(RunEvent::Complete(complete)) => break complete,
                None => return Err(anyhow!("Run ended without a completion")),
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!("Interrupted, canceling run");
                manager.cancel().await;
            }
        }
    };

    manager.close().await;
    println!("{}", formatter.format_run(&results, &complete));

    if args.save {
        let stored = StoredRun::new(sources, started_at, &complete, results);
        let path = results_storage(&config).save(&stored)?;
        eprintln!("Saved run {} to {}", stored.id, path.display());
    }

    Ok(if complete.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn results_storage(config: &AppConfig) -> ResultsStorage {
    config
        .results_dir
        .clone()
        .map(ResultsStorage::new)
        .unwrap_or_else(ResultsStorage::default_dir)
}

fn show_results(args: cli::ResultsArgs, config: &AppConfig) -> Result<ExitCode> {
    let storage = results_storage(config);
    let format = match &args.format {
        Some(format) => OutputFormat::from_str(format)
            .ok_or_else(|| anyhow!("Unknown output format: {format}"))?,
        None => config.output_format(),
    };
    let formatter = ResultFormatter::new(format);

    let selected = if let Some(id) = &args.id {
        Some(storage.load(id)?)
    } else if args.latest || args.export.is_some() {
        storage.latest()?
    } else {
        None
    };

    if let Some(path) = &args.export {
        let run = selected.ok_or_else(|| anyhow!("No stored run to export"))?;
        let export_format = ExportFormat::from_extension(path)
            .ok_or_else(|| anyhow!("Cannot export to {}: use .json or .csv", path.display()))?;
        storage.export(&run, path, export_format)?;
        println!("Exported run {} to {}", run.id, path.display());
        return Ok(ExitCode::SUCCESS);
    }

    match selected {
        Some(run) => println!("{}", formatter.format_stored_run(&run)),
        None if args.latest => println!("No stored runs in {}", storage.base_dir().display()),
        None => println!("{}", formatter.format_run_list(&storage.list()?)),
    }

    Ok(ExitCode::SUCCESS)
}

fn manage_config(args: cli::ConfigArgs, config: &AppConfig, env: &EnvConfig) -> Result<ExitCode> {
    if let Some(path) = &args.init {
        if path.exists() {
            return Err(anyhow!("{} already exists", path.display()));
        }
        AppConfig::default().save(path)?;
        println!("Wrote default configuration to {}", path.display());
    }

    if args.env {
        config::print_env_help();
        println!();
        env.print_summary();
    }

    if args.show || (args.init.is_none() && !args.env) {
        match AppConfig::find() {
            Some(path) => println!("# Loaded from {}", path.display()),
            None => println!("# No configuration file found, using defaults"),
        }
        println!("{}", serde_yaml::to_string(config)?);
    }

    Ok(ExitCode::SUCCESS)
}
