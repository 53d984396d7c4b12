//! Logging configuration and subscriber initialisation

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

use crate::error::PipelineError;

/// Logging configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level; `RUST_LOG` takes precedence when set
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Include target module information
    pub target: bool,
    /// Include thread ids
    pub thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            target: false,
            thread_ids: false,
        }
    }
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(PipelineError::Config {
                message: format!(
                    "Invalid log level: {}. Valid levels: error, warn, info, debug, trace",
                    other
                ),
            }),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line format
    Pretty,
    /// Single-line text format
    Compact,
    /// JSON lines for structured collection
    Json,
}

/// Logging system manager
pub struct LoggingSystem {
    config: LoggingConfig,
}

impl LoggingSystem {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    /// Environment filter: `RUST_LOG` if set, otherwise the configured level
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.config.level.as_filter()))
    }

    /// Install the global subscriber.
    ///
    /// Returns `false` when a subscriber was already installed; the existing one
    /// stays in place.
    pub fn initialize(&self) -> bool {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter())
            .with_target(self.config.target)
            .with_thread_ids(self.config.thread_ids);

        let installed = match self.config.format {
            LogFormat::Pretty => builder.pretty().try_init().is_ok(),
            LogFormat::Compact => builder.compact().try_init().is_ok(),
            LogFormat::Json => builder.json().try_init().is_ok(),
        };

        if installed {
            tracing::info!(
                "Logging initialized: level={}, format={:?}",
                self.config.level.as_filter(),
                self.config.format
            );
        }
        installed
    }

    /// Log build and platform information
    pub fn log_system_info(&self) {
        tracing::info!("vidshrink {}", env!("CARGO_PKG_VERSION"));
        tracing::info!("Platform: {}", std::env::consts::OS);
        tracing::info!(
            "Encoder backend: {}",
            if cfg!(feature = "libav") { "libav" } else { "mock" }
        );
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new(LoggingConfig::default())
    }
}

/// Install a global subscriber built from `config`; see [`LoggingSystem::initialize`]
pub fn init_logging(config: &LoggingConfig) -> bool {
    LoggingSystem::new(config.clone()).initialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_config_deserializes_partial_table() {
        let config: LoggingConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, LogLevel::Info);
        assert!(!config.thread_ids);
    }

    #[test]
    fn test_second_initialization_is_refused() {
        let system = LoggingSystem::new(LoggingConfig {
            format: LogFormat::Compact,
            ..Default::default()
        });
        let first = system.initialize();
        // some other test may have installed a subscriber already
        let second = system.initialize();
        assert!(!second || !first);
        assert!(!system.initialize());
    }
}
