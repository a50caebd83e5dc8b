//! fixloop - an autonomous local debugging loop
//!
//! Runs a command, extracts a signature from its failure, obtains a minimal
//! unified diff (replayed from the local fix memory or requested from a patch
//! generator), gates it through the diff guard and, when needed, a human,
//! applies it, re-runs verification and remembers fixes that passed.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): models, errors and the port traits
//! - **Application Layer** (`application`): the fix loop state machine
//! - **Service Layer** (`services`): signature extraction, diff guard, patch
//!   application, verification, workspace locking
//! - **Adapters** (`adapters`): `SQLite` fix memory, OpenAI-compatible generator
//! - **Infrastructure Layer** (`infrastructure`): config, logging, processes, credentials
//! - **CLI Layer** (`cli`): Command-line interface
//!
//! # Example
//!
//! ```ignore
//! use fixloop::application::{FixLoop, LoopConfig};
//!
//! let report = FixLoop::new(config, runner, memory, generator, approval)?
//!     .run()
//!     .await;
//! std::process::exit(report.exit_code());
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{FixLoop, LoopConfig, LoopOutcome, LoopReport, LoopState, StateKind};
pub use domain::errors::FixLoopError;
pub use domain::models::{
    ApprovalDecision, Config, ErrorSignature, MemoryEntry, Patch, Run, VerificationResult,
};
pub use domain::ports::{ApprovalGate, CommandRunner, FixMemory, PatchGenerator};
pub use infrastructure::config::{ConfigError, ConfigLoader};
