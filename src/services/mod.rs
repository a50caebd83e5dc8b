//! Services that make up one pass of the fix loop.

pub mod diff_guard;
pub mod patch_applier;
pub mod signature_extractor;
pub mod verifier;
pub mod workspace_lock;

pub use diff_guard::{GuardConfigError, GuardPolicy, SensitivePathSet};
pub use patch_applier::PatchApplier;
pub use signature_extractor::SignatureExtractor;
pub use verifier::Verifier;
pub use workspace_lock::WorkspaceLock;
