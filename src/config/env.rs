//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "TEST_FANOUT";

/// Configuration read from `TEST_FANOUT_*` environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// TEST_FANOUT_PARALLEL
    pub parallel: Option<bool>,
    /// TEST_FANOUT_MAX_WORKERS
    pub max_workers: Option<usize>,
    /// TEST_FANOUT_TIMEOUT, in seconds
    pub timeout: Option<u64>,
    /// TEST_FANOUT_FORMAT
    pub format: Option<String>,
    /// TEST_FANOUT_LOG_LEVEL
    pub log_level: Option<String>,
    /// TEST_FANOUT_CONFIG
    pub config_file: Option<String>,
    /// TEST_FANOUT_RESULTS_DIR
    pub results_dir: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            parallel: get_env_bool("PARALLEL"),
            max_workers: get_env_parse("MAX_WORKERS"),
            timeout: get_env_parse("TIMEOUT"),
            format: get_env("FORMAT"),
            log_level: get_env("LOG_LEVEL"),
            config_file: get_env("CONFIG"),
            results_dir: get_env("RESULTS_DIR"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.parallel.is_some()
            || self.max_workers.is_some()
            || self.timeout.is_some()
            || self.format.is_some()
            || self.log_level.is_some()
            || self.config_file.is_some()
            || self.results_dir.is_some()
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {ENV_PREFIX}_PARALLEL:     {:?}", self.parallel);
        println!("  {ENV_PREFIX}_MAX_WORKERS:  {:?}", self.max_workers);
        println!("  {ENV_PREFIX}_TIMEOUT:      {:?}", self.timeout);
        println!("  {ENV_PREFIX}_FORMAT:       {:?}", self.format);
        println!("  {ENV_PREFIX}_LOG_LEVEL:    {:?}", self.log_level);
        println!("  {ENV_PREFIX}_CONFIG:       {:?}", self.config_file);
        println!("  {ENV_PREFIX}_RESULTS_DIR:  {:?}", self.results_dir);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables in tests
#[cfg(test)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

#[cfg(test)]
impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    fn set(mut self, name: &str, value: impl ToString) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    pub fn parallel(self, parallel: bool) -> Self {
        self.set("PARALLEL", parallel)
    }

    pub fn max_workers(self, workers: usize) -> Self {
        self.set("MAX_WORKERS", workers)
    }

    pub fn timeout(self, timeout: u64) -> Self {
        self.set("TIMEOUT", timeout)
    }

    pub fn results_dir(self, dir: &str) -> Self {
        self.set("RESULTS_DIR", dir)
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
#[cfg(test)]
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

#[cfg(test)]
impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all TEST_FANOUT environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_PARALLEL      Run across several workers (true/false)");
    println!("  {ENV_PREFIX}_MAX_WORKERS   Upper bound on concurrent workers");
    println!("  {ENV_PREFIX}_TIMEOUT       Abort an operation after N seconds");
    println!("  {ENV_PREFIX}_FORMAT        Output format (table, json, json-pretty, summary)");
    println!("  {ENV_PREFIX}_LOG_LEVEL     Log level (trace, debug, info, warn, error)");
    println!("  {ENV_PREFIX}_CONFIG        Path to configuration file");
    println!("  {ENV_PREFIX}_RESULTS_DIR   Directory for stored runs");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_PARALLEL=true");
    println!("  export {ENV_PREFIX}_MAX_WORKERS=8");
    println!("  test-fanout run tests/*.yaml");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.parallel.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_env_builder() {
        let _guard = EnvBuilder::new()
            .max_workers(3)
            .timeout(60)
            .results_dir("/tmp/fanout-runs")
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.max_workers, Some(3));
        assert_eq!(config.timeout, Some(60));
        assert_eq!(config.results_dir.as_deref(), Some("/tmp/fanout-runs"));
        assert!(config.has_any());
    }

    #[test]
    fn test_env_bool_parsing() {
        let _guard = EnvBuilder::new().parallel(true).apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.parallel, Some(true));
    }

    #[test]
    fn test_unparsable_number_is_ignored() {
        let _guard = EnvBuilder::new().set("UNPARSABLE", "many").apply_scoped();
        assert_eq!(get_env_parse::<usize>("UNPARSABLE"), None);
    }
}
