//! Infrastructure layer module
//!
//! This module contains the concrete integrations the loop depends on:
//! - Configuration management
//! - Logging infrastructure
//! - Process execution
//! - Credentials management
//!
//! Infrastructure implementations satisfy the port traits defined in the domain layer.

pub mod config;
pub mod credentials;
pub mod logging;
pub mod process;
