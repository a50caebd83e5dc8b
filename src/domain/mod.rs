//! Domain layer for the fix loop
//!
//! This module contains the core models, port traits, and error types.

pub mod errors;
pub mod models;
pub mod ports;

// Re-export error types for convenient access
pub use errors::{
    ApplyError, ExecError, FixLoopError, GenerationError, LockError, RunContext, StoreError,
};
