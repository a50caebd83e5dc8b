use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::models::config::{Config, MemorySettings};

/// Directory under the home directory (and the project root) holding fixloop state
pub const FIXLOOP_DIR: &str = ".fixloop";

/// Configuration file name inside [`FIXLOOP_DIR`]
pub const CONFIG_FILE: &str = "config.yaml";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("loop.max_attempts is not set. Set it in .fixloop/config.yaml, FIXLOOP_LOOP__MAX_ATTEMPTS, or pass --max-attempts")]
    MissingMaxAttempts,

    #[error("Invalid max_attempts: {0}. Must be at least 1")]
    InvalidMaxAttempts(u32),

    #[error("Invalid {name}: must be greater than zero")]
    ZeroTimeout { name: &'static str },

    #[error("Invalid max_changed_lines: {0}. Must be at least 1")]
    InvalidMaxChangedLines(usize),

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Unknown provider kind: {0}. Supported: openai")]
    UnknownProvider(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Could not determine the home directory")]
    NoHomeDirectory,
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a project rooted at `project_root`
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. ~/.fixloop/config.yaml (user config)
    /// 3. <project>/.fixloop/config.yaml (project config, created by init)
    /// 4. Environment variables (FIXLOOP_* prefix, `__` separates sections)
    pub fn load(project_root: &Path) -> Result<Config, ConfigError> {
        Self::load_with_home(project_root, dirs::home_dir().as_deref())
    }

    /// Same as [`ConfigLoader::load`] with an explicit home directory
    pub fn load_with_home(project_root: &Path, home: Option<&Path>) -> Result<Config, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(home) = home {
            figment = figment.merge(Yaml::file(home.join(FIXLOOP_DIR).join(CONFIG_FILE)));
        }
        let config: Config = figment
            .merge(Yaml::file(project_root.join(FIXLOOP_DIR).join(CONFIG_FILE)))
            .merge(Env::prefixed("FIXLOOP_").split("__"))
            .extract()?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// `loop.max_attempts` may still be unset here; it is only required when
    /// a loop actually runs, see [`ConfigLoader::require_max_attempts`].
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if let Some(attempts) = config.fix_loop.max_attempts {
            if attempts == 0 {
                return Err(ConfigError::InvalidMaxAttempts(attempts));
            }
        }

        if config.fix_loop.command_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                name: "loop.command_timeout_secs",
            });
        }
        if config.fix_loop.verify_timeout_secs == Some(0) {
            return Err(ConfigError::ZeroTimeout {
                name: "loop.verify_timeout_secs",
            });
        }
        if config.fix_loop.approval_timeout_secs == Some(0) {
            return Err(ConfigError::ZeroTimeout {
                name: "loop.approval_timeout_secs",
            });
        }
        if config.provider.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                name: "provider.request_timeout_secs",
            });
        }

        if config.guard.max_changed_lines == 0 {
            return Err(ConfigError::InvalidMaxChangedLines(
                config.guard.max_changed_lines,
            ));
        }

        if config.memory.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.memory.max_connections,
            ));
        }
        if config
            .memory
            .database_path
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            return Err(ConfigError::EmptyDatabasePath);
        }

        if config.provider.kind != "openai" {
            return Err(ConfigError::UnknownProvider(config.provider.kind.clone()));
        }

        // Validate logging config
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(
                config.logging.rotation.clone(),
            ));
        }

        Ok(())
    }

    /// The attempt bound, which has no default
    pub fn require_max_attempts(config: &Config) -> Result<u32, ConfigError> {
        match config.fix_loop.max_attempts {
            None => Err(ConfigError::MissingMaxAttempts),
            Some(0) => Err(ConfigError::InvalidMaxAttempts(0)),
            Some(attempts) => Ok(attempts),
        }
    }
}

/// `~/.fixloop`
pub fn fixloop_home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(FIXLOOP_DIR))
        .ok_or(ConfigError::NoHomeDirectory)
}

/// Database file location, expanding a leading `~/`
pub fn resolve_database_path(memory: &MemorySettings) -> Result<PathBuf, ConfigError> {
    match memory.database_path.as_deref() {
        Some(path) => expand_home(path),
        None => Ok(fixloop_home()?.join("fixloop.db")),
    }
}

fn expand_home(path: &str) -> Result<PathBuf, ConfigError> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .ok_or(ConfigError::NoHomeDirectory),
        None => Ok(PathBuf::from(path)),
    }
}
