//! Runtime configuration for the object-data layer.
//!
//! Configuration is read from a TOML document with three tables:
//!
//! ```toml
//! [mutation]
//! create_concurrency = 50
//! max_sequence_retries = 10
//!
//! [query]
//! strict = true
//!
//! [logging]
//! default_level = "info"
//! ```
//!
//! Every field has a default, and `OBJECTFOLD_*` environment variables
//! override the file.

pub mod error;

pub use error::{ConfigError, ConfigResult};

use crate::constants::*;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete crate configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectConfig {
    pub mutation: MutationConfig,
    pub query: QueryConfig,
    pub logging: LogConfig,
}

/// Limits applied by the mutation orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// In-flight document preparations per create batch
    pub create_concurrency: usize,
    /// Attempts made when a sequence-guarded save conflicts
    pub max_sequence_retries: usize,
    /// Documents a single patch call may touch outside scripts
    pub max_updates_per_call: usize,
    /// Documents loaded per delete batch
    pub delete_batch_size: usize,
    /// Per-item failures tolerated before a batch halts
    pub max_write_errors: usize,
    /// Script time that must remain before another document is processed
    pub min_script_time_left_ms: u64,
    /// Upper bound of the per-attempt retry back-off step
    pub retry_jitter_ms: u64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            create_concurrency: DEFAULT_CREATE_CONCURRENCY,
            max_sequence_retries: DEFAULT_MAX_SEQUENCE_RETRIES,
            max_updates_per_call: DEFAULT_MAX_UPDATES_PER_CALL,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
            max_write_errors: DEFAULT_MAX_WRITE_ERRORS,
            min_script_time_left_ms: DEFAULT_MIN_SCRIPT_TIME_LEFT_MS,
            retry_jitter_ms: DEFAULT_RETRY_JITTER_MS,
        }
    }
}

impl MutationConfig {
    pub fn min_script_time_left(&self) -> Duration {
        Duration::from_millis(self.min_script_time_left_ms)
    }
}

/// Projection compilation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Reject projections whose paths resolve to no schema node
    pub strict: bool,
    /// Permit projecting `System` level properties
    pub allow_system_access: bool,
}

impl ObjectConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        log::info!("loaded object configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `OBJECTFOLD_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(std::env::vars())
    }

    fn apply_overrides<I>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("OBJECTFOLD_") else {
                continue;
            };
            let mutation = &mut self.mutation;
            match name {
                "LOG_LEVEL" => self.logging.default_level = value,
                "QUERY_STRICT" => self.query.strict = parse_env(&key, &value)?,
                "CREATE_CONCURRENCY" => mutation.create_concurrency = parse_env(&key, &value)?,
                "MAX_SEQUENCE_RETRIES" => mutation.max_sequence_retries = parse_env(&key, &value)?,
                "MAX_UPDATES_PER_CALL" => mutation.max_updates_per_call = parse_env(&key, &value)?,
                "DELETE_BATCH_SIZE" => mutation.delete_batch_size = parse_env(&key, &value)?,
                "MAX_WRITE_ERRORS" => mutation.max_write_errors = parse_env(&key, &value)?,
                _ => log::warn!("ignoring unknown configuration override {}", key),
            }
        }
        Ok(())
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let m = &self.mutation;
        if m.create_concurrency == 0 {
            return Err(ConfigError::validation("create_concurrency must be at least 1"));
        }
        if m.max_sequence_retries == 0 {
            return Err(ConfigError::validation("max_sequence_retries must be at least 1"));
        }
        if m.delete_batch_size == 0 {
            return Err(ConfigError::validation("delete_batch_size must be at least 1"));
        }
        if m.max_updates_per_call == 0 {
            return Err(ConfigError::validation("max_updates_per_call must be at least 1"));
        }
        if !LogConfig::is_valid_level(&self.logging.default_level) {
            return Err(ConfigError::validation(format!(
                "unknown log level '{}'",
                self.logging.default_level
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.parse().map_err(|_| ConfigError::Environment {
        key: key.to_string(),
        value: value.to_string(),
    })
}
