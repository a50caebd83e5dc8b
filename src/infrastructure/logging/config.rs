use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::models::LoggingConfig;

/// Logging configuration as the subscriber consumes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Console output format (json, pretty)
    pub format: LogFormat,

    /// Directory for log files (optional, if None logs only to stderr)
    pub log_dir: Option<PathBuf>,

    /// Log rotation policy for files under `log_dir`
    pub rotation: RotationPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    #[default]
    Daily,
    Hourly,
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from(&LoggingConfig::default())
    }
}

impl From<&LoggingConfig> for LogConfig {
    /// Values are validated by the config loader; unknown strings fall back
    /// to the defaults here.
    fn from(config: &LoggingConfig) -> Self {
        let format = match config.format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let rotation = match config.rotation.as_str() {
            "hourly" => RotationPolicy::Hourly,
            "never" => RotationPolicy::Never,
            _ => RotationPolicy::Daily,
        };
        Self {
            level: config.level.clone(),
            format,
            log_dir: config.log_dir.as_ref().map(PathBuf::from),
            rotation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_logging_config() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            log_dir: Some("/tmp/fixloop-logs".to_string()),
            rotation: "hourly".to_string(),
        };
        let log = LogConfig::from(&config);
        assert_eq!(log.level, "debug");
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(log.log_dir, Some(PathBuf::from("/tmp/fixloop-logs")));
        assert_eq!(log.rotation, RotationPolicy::Hourly);
    }

    #[test]
    fn test_default_is_pretty_stderr() {
        let log = LogConfig::default();
        assert_eq!(log.format, LogFormat::Pretty);
        assert!(log.log_dir.is_none());
        assert_eq!(log.level, "warn");
    }
}
