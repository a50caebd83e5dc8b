//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber:
//! - Pretty or JSON console output on stderr
//! - Optional rotated JSON log files
//! - Secret scrubbing on every sink

pub mod config;
pub mod logger;
pub mod secret_scrubbing;

pub use config::{LogConfig, LogFormat, RotationPolicy};
pub use logger::LoggerImpl;
pub use secret_scrubbing::{ScrubbingMakeWriter, SecretScrubber};
