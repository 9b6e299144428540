//! Configuration error types

/// Errors raised while loading or validating [`crate::config::ObjectConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO-related errors (file access, permissions, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation errors
    #[error("Configuration validation error: {0}")]
    Validation(String),

    /// Environment override could not be parsed
    #[error("Invalid environment override {key}: {value}")]
    Environment { key: String, value: String },

    /// Logger could not be installed
    #[error("Logging initialization error: {0}")]
    Logging(String),
}

impl ConfigError {
    /// Create a validation error with context
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a logging error with context
    pub fn logging<S: Into<String>>(msg: S) -> Self {
        Self::Logging(msg.into())
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
