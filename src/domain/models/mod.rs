//! Domain models for the fix loop.

pub mod config;
pub mod decision;
pub mod memory;
pub mod patch;
pub mod run;
pub mod signature;
pub mod verification;

pub use config::{
    Config, GuardSettings, LoggingConfig, LoopSettings, MemorySettings, ProviderSettings,
};
pub use decision::{ApprovalDecision, ApprovedPatch, PolicyViolation, ScopeReason};
pub use memory::{MemoryEntry, RecordMeta};
pub use patch::{DiffLine, FilePatch, Hunk, HunkConflict, Patch, PatchOrigin, PatchParseError};
pub use run::Run;
pub use signature::{ErrorSignature, Frame};
pub use verification::{UnrelatedReason, VerificationResult};
