//! Output formatters for discovery and run outcomes
//!
//! Provides JSON, Table, and summary output formats.

use serde::Serialize;

use crate::events::{DiscoveryComplete, LogMessage, MessageLevel, RunComplete};
use crate::models::{TestCase, TestOutcome, TestResult};
use crate::results::{RunInfo, StoredRun};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }

    /// Whether tests and results are printed as they arrive.
    ///
    /// JSON formats print one document once the operation completes.
    pub fn is_streaming(self) -> bool {
        matches!(self, OutputFormat::Table | OutputFormat::Summary)
    }
}

#[derive(Serialize)]
struct DiscoveryDocument<'a> {
    tests: &'a [TestCase],
    #[serde(flatten)]
    complete: &'a DiscoveryComplete,
}

#[derive(Serialize)]
struct RunDocument<'a> {
    results: &'a [TestResult],
    #[serde(flatten)]
    complete: &'a RunComplete,
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    fn paint(&self, color: &str, text: impl AsRef<str>) -> String {
        if self.colorize {
            format!("{color}{}{RESET}", text.as_ref())
        } else {
            text.as_ref().to_string()
        }
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        if self.format == OutputFormat::JsonPretty {
            serde_json::to_string_pretty(value).unwrap_or_default()
        } else {
            serde_json::to_string(value).unwrap_or_default()
        }
    }

    /// Format one discovered test
    pub fn format_test_case(&self, test: &TestCase) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(test),
            OutputFormat::Table => match test.line {
                Some(line) => format!("  {:50} {}:{}", test.name, test.source, line),
                None => format!("  {:50} {}", test.name, test.source),
            },
            OutputFormat::Summary => test.name.clone(),
        }
    }

    /// Format a single test result
    pub fn format_result(&self, result: &TestResult) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(result),
            OutputFormat::Table => self.format_result_table(result),
            OutputFormat::Summary => format!(
                "{} {} ({}ms)",
                result.outcome.symbol(),
                result.test_case.name,
                result.duration_ms
            ),
        }
    }

    fn format_result_table(&self, result: &TestResult) -> String {
        let label = format!("{} {}", result.outcome.symbol(), result.outcome);
        let status = match result.outcome {
            TestOutcome::Passed => self.paint(GREEN, format!("{label:11}")),
            TestOutcome::Failed => self.paint(RED, format!("{label:11}")),
            _ => self.paint(YELLOW, format!("{label:11}")),
        };

        let mut line = format!(
            "{} {:50} [{:>6}ms]",
            status, result.test_case.name, result.duration_ms
        );
        if let Some(message) = &result.message {
            line.push_str(&format!("\n      {message}"));
        }
        line
    }

    /// Format a message relayed from a worker or the engine
    pub fn format_message(&self, message: &LogMessage) -> String {
        match message.level {
            MessageLevel::Informational => message.to_string(),
            MessageLevel::Warning => self.paint(YELLOW, message.to_string()),
            MessageLevel::Error => self.paint(RED, message.to_string()),
        }
    }

    /// Format a finished discovery
    ///
    /// `tests` is everything streamed during the operation; streaming formats
    /// have already printed it and only get the footer.
    pub fn format_discovery(&self, tests: &[TestCase], complete: &DiscoveryComplete) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => {
                self.to_json(&DiscoveryDocument { tests, complete })
            }
            OutputFormat::Table => self.format_discovery_table(complete),
            OutputFormat::Summary => {
                if complete.is_aborted {
                    format!(
                        "Discovery aborted after {} tests ({} sources not discovered)",
                        tests.len(),
                        complete.not_discovered_sources.len()
                    )
                } else {
                    format!(
                        "Discovered {} tests in {} sources",
                        complete.total_count,
                        complete.fully_discovered_sources.len()
                    )
                }
            }
        }
    }

    fn format_discovery_table(&self, complete: &DiscoveryComplete) -> String {
        let mut output = String::new();

        output.push_str("\n═══════════════════════════════════════════════════════════════\n");
        if complete.is_aborted {
            output.push_str(&format!(" {}\n", self.paint(RED, "Discovery aborted")));
        } else {
            output.push_str(&format!(" Discovered {} tests\n", complete.total_count));
        }
        output.push_str("═══════════════════════════════════════════════════════════════\n");

        let groups = [
            ("Fully discovered", &complete.fully_discovered_sources, GREEN),
            ("Partially discovered", &complete.partially_discovered_sources, YELLOW),
            ("Not discovered", &complete.not_discovered_sources, RED),
            ("Skipped", &complete.skipped_sources, YELLOW),
        ];
        for (label, sources, color) in groups {
            if sources.is_empty() {
                continue;
            }
            output.push_str(&format!(" {} ({}):\n", self.paint(color, label), sources.len()));
            for source in sources {
                output.push_str(&format!("   - {source}\n"));
            }
        }

        output
    }

    /// Format a finished run
    pub fn format_run(&self, results: &[TestResult], complete: &RunComplete) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => {
                self.to_json(&RunDocument { results, complete })
            }
            OutputFormat::Table => self.format_run_table(complete),
            OutputFormat::Summary => format!(
                "{}/{} passed ({:.1}%) in {}ms{}",
                complete.stats.count(TestOutcome::Passed),
                complete.stats.executed,
                complete.stats.pass_rate(),
                complete.elapsed.as_millis(),
                stop_suffix(complete)
            ),
        }
    }

    fn format_run_table(&self, complete: &RunComplete) -> String {
        let stats = &complete.stats;
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");

        let failed = stats.count(TestOutcome::Failed);
        let fail_str = if failed > 0 {
            self.paint(RED, failed.to_string())
        } else {
            failed.to_string()
        };
        output.push_str(&format!(
            "║  Total: {:4} | Pass: {} | Fail: {} | Skip: {:4}\n",
            stats.executed,
            self.paint(GREEN, stats.count(TestOutcome::Passed).to_string()),
            fail_str,
            stats.count(TestOutcome::Skipped)
        ));
        output.push_str(&format!(
            "║  Pass Rate: {:5.1}% | Duration: {:6}ms\n",
            stats.pass_rate(),
            complete.elapsed.as_millis()
        ));
        if complete.is_aborted {
            output.push_str(&format!("║  {}\n", self.paint(RED, "Run aborted")));
        } else if complete.is_canceled {
            output.push_str(&format!("║  {}\n", self.paint(YELLOW, "Run canceled")));
        }
        for source in &complete.skipped_sources {
            output.push_str(&format!("║  Skipped: {source}\n"));
        }
        for error in &complete.errors {
            output.push_str(&format!("║  {}\n", self.paint(RED, error)));
        }

        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");
        output
    }

    /// Format the list of stored runs
    pub fn format_run_list(&self, runs: &[RunInfo]) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(&runs),
            _ => {
                if runs.is_empty() {
                    return "No stored runs".to_string();
                }
                let mut output = String::new();
                output.push_str(&format!(
                    "{:22} {:20} {:>8} {:>8}\n",
                    "ID", "Started", "Tests", "Pass"
                ));
                for run in runs {
                    output.push_str(&format!(
                        "{:22} {:20} {:>8} {:>7.1}%{}\n",
                        run.id,
                        run.started_at.format("%Y-%m-%d %H:%M:%S"),
                        run.executed,
                        run.pass_rate,
                        if run.is_aborted { " (aborted)" } else { "" }
                    ));
                }
                output
            }
        }
    }

    /// Format a stored run with all of its results
    pub fn format_stored_run(&self, run: &StoredRun) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(run),
            _ => {
                let mut output = format!(
                    "Run {} ({})\n",
                    run.id,
                    run.started_at.format("%Y-%m-%d %H:%M:%S")
                );
                for result in &run.results {
                    output.push_str(&self.format_result(result));
                    output.push('\n');
                }
                output.push_str(&format!("{}\n", run.stats));
                output
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn stop_suffix(complete: &RunComplete) -> &'static str {
    if complete.is_aborted {
        " [aborted]"
    } else if complete.is_canceled {
        " [canceled]"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStats;
    use std::time::Duration;

    fn case(name: &str) -> TestCase {
        TestCase::new(name, "unit.yaml", "executor://manifest")
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("TABLE"), Some(OutputFormat::Table));
        assert_eq!(OutputFormat::from_str("csv"), None);
        assert!(OutputFormat::Summary.is_streaming());
        assert!(!OutputFormat::JsonPretty.is_streaming());
    }

    #[test]
    fn test_format_result() {
        let result = TestResult::fail(case("math::divides"), 12, "division by zero");
        let output = ResultFormatter::new(OutputFormat::Table)
            .no_color()
            .format_result(&result);
        assert!(output.contains("math::divides"));
        assert!(output.contains("FAIL"));
        assert!(output.contains("division by zero"));
        assert!(!output.contains('\x1b'));
    }

    #[test]
    fn test_discovery_json_includes_tests_and_sources() {
        let mut complete = DiscoveryComplete::completed(2);
        complete.fully_discovered_sources = vec!["unit.yaml".to_string()];
        let tests = vec![case("a"), case("b")];

        let output = ResultFormatter::new(OutputFormat::Json).format_discovery(&tests, &complete);
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["tests"].as_array().unwrap().len(), 2);
        assert_eq!(value["total_count"], 2);
        assert_eq!(value["fully_discovered_sources"][0], "unit.yaml");
    }

    #[test]
    fn test_aborted_discovery_table() {
        let mut complete = DiscoveryComplete::aborted();
        complete.not_discovered_sources = vec!["slow.yaml".to_string()];

        let output = ResultFormatter::new(OutputFormat::Table)
            .no_color()
            .format_discovery(&[], &complete);
        assert!(output.contains("Discovery aborted"));
        assert!(output.contains("Not discovered (1)"));
        assert!(output.contains("slow.yaml"));
    }

    #[test]
    fn test_run_summary() {
        let mut stats = RunStats::default();
        stats.record(TestOutcome::Passed);
        stats.record(TestOutcome::Failed);
        let mut complete = RunComplete::completed(stats, Duration::from_millis(40));
        complete.is_canceled = true;

        let output = ResultFormatter::new(OutputFormat::Summary).format_run(&[], &complete);
        assert_eq!(output, "1/2 passed (50.0%) in 40ms [canceled]");
    }

    #[test]
    fn test_empty_run_list() {
        let output = ResultFormatter::new(OutputFormat::Table).format_run_list(&[]);
        assert_eq!(output, "No stored runs");
    }
}
