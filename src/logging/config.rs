//! Configuration for the logging system
//!
//! Loaded as the `[logging]` table of the object configuration and adjustable
//! through environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main logging configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default log level for all modules
    pub default_level: String,
    /// Line format written by the logger
    pub format: LogFormat,
    /// Include timestamps
    pub include_timestamp: bool,
    /// Per-module log levels, keyed by module path (`objectfold::mutation`)
    pub features: HashMap<String, String>,
}

/// Output line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    /// One JSON object per line
    Json,
}

const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            format: LogFormat::Plain,
            include_timestamp: true,
            features: HashMap::new(),
        }
    }
}

impl LogConfig {
    /// Whether `level` names a level the logger understands
    pub fn is_valid_level(level: &str) -> bool {
        LEVELS.contains(&level.to_ascii_lowercase().as_str())
    }

    /// Filter directive in `env_logger` syntax, default level first
    pub fn filter_directive(&self) -> String {
        let mut features: Vec<_> = self.features.iter().collect();
        features.sort();
        let mut parts = vec![self.default_level.to_ascii_lowercase()];
        for (module, level) in features {
            parts.push(format!("{}={}", module, level.to_ascii_lowercase()));
        }
        parts.join(",")
    }
}
