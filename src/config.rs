//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults (every field has one)
//! 2. A TOML file (`config/logwatch.toml` unless another path is given; a missing
//!    file is not an error)
//! 3. Environment variables prefixed with `LOGWATCH_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use rust_logwatch::config::LogwatchConfig;
//!
//! let config = LogwatchConfig::load()?;
//! println!("Sources: {}", config.sources.count);
//! # Ok::<(), rust_logwatch::error::PipelineError>(())
//! ```
//!
//! Environment override example: `LOGWATCH_SOURCES__COUNT=100`.

use crate::error::{AppResult, PipelineError};
use crate::parser::MatchMode;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/logwatch.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LOGWATCH_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogwatchConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Synthetic source settings
    pub sources: SourcesConfig,
    /// Stage and run settings
    pub pipeline: PipelineConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Emitter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Number of emitters
    #[serde(default = "default_source_count")]
    pub count: usize,
    /// Pause between two lines of one emitter
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound of the extra per-emitter interval drawn at start
    #[serde(default, with = "humantime_serde")]
    pub interval_jitter: Duration,
    /// Base seed; emitter `i` uses `seed + i`
    #[serde(default)]
    pub seed: Option<u64>,
    /// Emitter names are `{key_prefix}{index}`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Probability of emitting a malformed line
    #[serde(default)]
    pub malformed_rate: f64,
    /// Inclusive upper bound of emitted values
    #[serde(default = "default_value_max")]
    pub value_max: i64,
}

/// Pipeline run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Wall-clock duration of a timed run
    #[serde(default = "default_run_duration", with = "humantime_serde")]
    pub run_duration: Duration,
    /// Require records to match the full line
    #[serde(default)]
    pub strict_records: bool,
    /// Input line that ends an interactive run
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
    /// Forget keys idle for longer than this (never, when unset)
    #[serde(default, with = "humantime_serde")]
    pub idle_key_ttl: Option<Duration>,
}

// Default value functions
fn default_name() -> String {
    "rust_logwatch".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_source_count() -> usize {
    10
}

fn default_interval() -> Duration {
    crate::emitter::DEFAULT_INTERVAL
}

fn default_key_prefix() -> String {
    "p".to_string()
}

fn default_value_max() -> i64 {
    crate::emitter::DEFAULT_VALUE_MAX
}

fn default_run_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_sentinel() -> String {
    "X".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            count: default_source_count(),
            interval: default_interval(),
            interval_jitter: Duration::ZERO,
            seed: None,
            key_prefix: default_key_prefix(),
            malformed_rate: 0.0,
            value_max: default_value_max(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_duration: default_run_duration(),
            strict_records: false,
            sentinel: default_sentinel(),
            idle_key_ttl: None,
        }
    }
}

impl LogwatchConfig {
    /// Load from the default file and environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(PipelineError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(PipelineError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.sources.interval.is_zero() {
            return Err(PipelineError::Configuration(
                "sources.interval must be greater than zero".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.sources.malformed_rate) {
            return Err(PipelineError::Configuration(format!(
                "Invalid malformed_rate {}. Must be 0.0-1.0",
                self.sources.malformed_rate
            )));
        }

        if self.sources.value_max < 0 {
            return Err(PipelineError::Configuration(format!(
                "Invalid value_max {}. Must not be negative",
                self.sources.value_max
            )));
        }

        // Emitted keys must themselves satisfy the record grammar.
        let prefix = &self.sources.key_prefix;
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(PipelineError::Configuration(format!(
                "Invalid key_prefix '{}'. Must be non-empty word characters",
                prefix
            )));
        }

        if self.pipeline.sentinel.is_empty() {
            return Err(PipelineError::Configuration(
                "pipeline.sentinel must not be empty".into(),
            ));
        }

        if self.pipeline.idle_key_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(PipelineError::Configuration(
                "pipeline.idle_key_ttl must be greater than zero when set".into(),
            ));
        }

        Ok(())
    }

    /// Record grammar mode selected by `strict_records`.
    pub fn match_mode(&self) -> MatchMode {
        if self.pipeline.strict_records {
            MatchMode::FullLine
        } else {
            MatchMode::Prefix
        }
    }

    /// Seed for the emitter at `index`, if a base seed is configured.
    pub fn emitter_seed(&self, index: usize) -> Option<u64> {
        self.sources
            .seed
            .map(|seed| seed.wrapping_add(index as u64))
    }
}
