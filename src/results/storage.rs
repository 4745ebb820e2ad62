//! Results storage and retrieval
//!
//! Persists finished runs as JSON, one file per run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::events::RunComplete;
use crate::models::{RunStats, TestResult};

/// A finished run as written to disk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRun {
    /// Unique run ID
    pub id: String,

    /// Timestamp when the run started
    pub started_at: DateTime<Utc>,

    /// Timestamp when the run was stored
    pub completed_at: DateTime<Utc>,

    /// Sources requested by the caller
    pub sources: Vec<String>,

    pub stats: RunStats,
    pub is_canceled: bool,
    pub is_aborted: bool,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,

    /// Sources that could not be scheduled
    #[serde(default)]
    pub skipped_sources: Vec<String>,

    /// Individual test results, in arrival order
    pub results: Vec<TestResult>,

    /// Tool version that produced the run
    pub tool_version: String,
}

impl StoredRun {
    pub fn new(
        sources: Vec<String>,
        started_at: DateTime<Utc>,
        complete: &RunComplete,
        results: Vec<TestResult>,
    ) -> Self {
        Self {
            id: generate_run_id(),
            started_at,
            completed_at: Utc::now(),
            sources,
            stats: complete.stats.clone(),
            is_canceled: complete.is_canceled,
            is_aborted: complete.is_aborted,
            errors: complete.errors.clone(),
            elapsed_ms: complete.elapsed.as_millis() as u64,
            skipped_sources: complete.skipped_sources.clone(),
            results,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Generate unique run ID
fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let random: u32 = rand::random::<u32>() % 10000;
    format!("{timestamp}_{random:04}")
}

/// Results storage manager
pub struct ResultsStorage {
    /// Base directory for results
    base_dir: PathBuf,
}

impl ResultsStorage {
    /// Create a new results storage
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create with default directory
    pub fn default_dir() -> Self {
        let base_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("test-fanout")
            .join("runs");
        Self::new(base_dir)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }

    /// Save a run
    pub fn save(&self, run: &StoredRun) -> Result<PathBuf> {
        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!("Failed to create results dir {}", self.base_dir.display())
        })?;

        let path = self.run_path(&run.id);
        let file = File::create(&path).context("Failed to create results file")?;
        serde_json::to_writer_pretty(BufWriter::new(file), run)
            .context("Failed to write results")?;

        info!("Saved run results to {}", path.display());
        Ok(path)
    }

    /// Load a run by ID
    pub fn load(&self, run_id: &str) -> Result<StoredRun> {
        self.load_from_path(&self.run_path(run_id))
    }

    pub fn load_from_path(&self, path: &Path) -> Result<StoredRun> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open results file {}", path.display()))?;
        let run = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse results file {}", path.display()))?;
        debug!("Loaded run results from {}", path.display());
        Ok(run)
    }

    /// All stored runs, newest first. Unreadable files are skipped.
    pub fn load_all(&self) -> Result<Vec<StoredRun>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match self.load_from_path(&path) {
                    Ok(run) => runs.push(run),
                    Err(e) => debug!("Skipping {}: {:#}", path.display(), e),
                }
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    /// Brief information about every stored run, newest first
    pub fn list(&self) -> Result<Vec<RunInfo>> {
        Ok(self
            .load_all()?
            .into_iter()
            .map(|run| RunInfo {
                pass_rate: run.stats.pass_rate(),
                executed: run.stats.executed,
                is_aborted: run.is_aborted,
                id: run.id,
                started_at: run.started_at,
            })
            .collect())
    }

    pub fn latest(&self) -> Result<Option<StoredRun>> {
        Ok(self.load_all()?.into_iter().next())
    }

    /// Export a run to a file
    pub fn export(&self, run: &StoredRun, path: &Path, format: ExportFormat) -> Result<()> {
        match format {
            ExportFormat::Json => {
                let file = File::create(path)?;
                serde_json::to_writer_pretty(BufWriter::new(file), run)?;
            }
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_path(path)?;
                writer.write_record(["source", "test_name", "outcome", "duration_ms", "message"])?;
                for result in &run.results {
                    writer.write_record([
                        result.test_case.source.clone(),
                        result.test_case.name.clone(),
                        result.outcome.to_string(),
                        result.duration_ms.to_string(),
                        result.message.clone().unwrap_or_default(),
                    ])?;
                }
                writer.flush()?;
            }
        }

        info!("Exported run {} to {}", run.id, path.display());
        Ok(())
    }
}

/// Brief run information
#[derive(Clone, Debug, Serialize)]
pub struct RunInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub executed: u64,
    pub pass_rate: f64,
    pub is_aborted: bool,
}

/// Export format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_str)
    }
}
