//! Logger installation.
//!
//! The crate logs through the `log` facade; binaries and tests call
//! [`init_logging`] once to route records through `env_logger`.

pub mod config;

pub use config::{LogConfig, LogFormat};

use crate::config::ConfigError;
use std::io::Write;

/// Install an `env_logger` backend configured from `config`.
///
/// Installing twice is not an error; the first logger stays active.
pub fn init_logging(config: &LogConfig) -> Result<(), ConfigError> {
    if !LogConfig::is_valid_level(&config.default_level) {
        return Err(ConfigError::logging(format!(
            "unknown log level '{}'",
            config.default_level
        )));
    }

    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&config.filter_directive());

    let include_timestamp = config.include_timestamp;
    match config.format {
        LogFormat::Plain => {
            builder.format(move |buf, record| {
                if include_timestamp {
                    write!(buf, "{} ", chrono::Utc::now().to_rfc3339())?;
                }
                writeln!(
                    buf,
                    "[{}] {}: {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
        LogFormat::Json => {
            builder.format(move |buf, record| {
                let mut line = serde_json::json!({
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                if include_timestamp {
                    line["timestamp"] = serde_json::Value::String(chrono::Utc::now().to_rfc3339());
                }
                writeln!(buf, "{}", line)
            });
        }
    }

    if builder.try_init().is_err() {
        log::debug!("logger already installed, keeping existing configuration");
    }
    Ok(())
}
