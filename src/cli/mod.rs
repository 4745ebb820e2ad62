//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parallel test discovery and execution across a pool of workers
#[derive(Parser, Debug)]
#[command(name = "test-fanout")]
#[command(author = "hephaex@gmail.com")]
#[command(version)]
#[command(about = "Discover and run tests across a pool of isolated workers")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (overrides the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover the tests contained in test sources
    Discover(DiscoverArgs),

    /// Run the tests contained in test sources
    Run(RunArgs),

    /// View stored run results
    Results(ResultsArgs),

    /// Show or create configuration
    Config(ConfigArgs),
}

/// Options shared by discover and run
#[derive(Parser, Debug)]
pub struct OperationArgs {
    /// Test source manifests
    #[arg(required = true)]
    pub sources: Vec<String>,

    /// Spread sources across several workers
    #[arg(short, long)]
    pub parallel: bool,

    /// Maximum number of concurrent workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Only include tests whose name contains this text
    #[arg(long)]
    pub filter: Option<String>,

    /// Abort the operation after this many seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Output format (table, json, json-pretty, summary)
    #[arg(short, long)]
    pub format: Option<String>,
}

/// Arguments for discover command
#[derive(Parser, Debug)]
pub struct DiscoverArgs {
    #[command(flatten)]
    pub operation: OperationArgs,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub operation: OperationArgs,

    /// Store the finished run
    #[arg(short, long)]
    pub save: bool,
}

/// Arguments for results command
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Show the most recent run
    #[arg(short, long)]
    pub latest: bool,

    /// Show a specific run
    #[arg(long, conflicts_with = "latest")]
    pub id: Option<String>,

    /// Export the selected run (.json or .csv)
    #[arg(short, long)]
    pub export: Option<PathBuf>,

    /// Output format
    #[arg(short, long)]
    pub format: Option<String>,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Write a default configuration file to this path
    #[arg(long)]
    pub init: Option<PathBuf>,

    /// Print the effective configuration
    #[arg(long)]
    pub show: bool,

    /// List supported environment variables
    #[arg(long)]
    pub env: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_args() {
        let args = Args::parse_from([
            "test-fanout",
            "discover",
            "a.yaml",
            "b.yaml",
            "--parallel",
            "--workers",
            "3",
        ]);
        match args.command {
            Command::Discover(discover) => {
                assert_eq!(discover.operation.sources, vec!["a.yaml", "b.yaml"]);
                assert!(discover.operation.parallel);
                assert_eq!(discover.operation.workers, Some(3));
            }
            _ => panic!("Expected Discover command"),
        }
    }

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "test-fanout",
            "--verbose",
            "run",
            "suite.yaml",
            "--filter",
            "login",
            "--timeout",
            "30",
            "--save",
        ]);
        assert!(args.verbose);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.operation.filter.as_deref(), Some("login"));
                assert_eq!(run.operation.timeout, Some(30));
                assert!(run.save);
                assert!(!run.operation.parallel);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_sources_required() {
        assert!(Args::try_parse_from(["test-fanout", "run"]).is_err());
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let args = Args::parse_from(["test-fanout", "results", "--latest", "-c", "my.yaml"]);
        assert_eq!(args.config, Some(PathBuf::from("my.yaml")));
        match args.command {
            Command::Results(results) => assert!(results.latest),
            _ => panic!("Expected Results command"),
        }
    }
}
