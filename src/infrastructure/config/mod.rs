//! Configuration management infrastructure
//!
//! Hierarchical configuration using figment:
//! - YAML file loading (user and project)
//! - Environment variable overrides
//! - Configuration validation
//! - Path resolution for the memory store

pub mod loader;

pub use loader::{
    fixloop_home, resolve_database_path, ConfigError, ConfigLoader, CONFIG_FILE, FIXLOOP_DIR,
};
