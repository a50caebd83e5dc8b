//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines async trait interfaces that adapters must implement:
//! - `CommandRunner`: executing shell commands
//! - `PatchGenerator`: the external patch-proposing collaborator
//! - `FixMemory`: persistent store of verified fixes
//! - `ApprovalGate`: asking a human about a patch
//!
//! These traits keep the loop independent of processes, HTTP, `SQLite`, and
//! terminals, so each can be replaced by a scripted fake in tests.

pub mod approval;
pub mod command_runner;
pub mod fix_memory;
pub mod patch_generator;

pub use approval::{ApprovalAnswer, ApprovalGate, ApprovalPrompt};
pub use command_runner::{CommandRunner, CommandSpec};
pub use fix_memory::FixMemory;
pub use patch_generator::{FileContext, PatchGenerator, PatchRequest, PatchResponse, PriorAttempt};
