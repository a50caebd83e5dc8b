//! Domain errors for the fix loop.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use super::models::{ErrorSignature, HunkConflict, PolicyViolation, Run, VerificationResult};

/// Fix memory storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("Corrupt memory entry {fingerprint}: {reason}")]
    CorruptEntry { fingerprint: String, reason: String },

    #[error("Refusing to record a fix whose verification did not pass: {0}")]
    NotVerified(VerificationResult),
}

/// Failure to start or observe a child process.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed while waiting for '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Patch generator failures
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Patch generator unreachable: {0}")]
    Unreachable(String),

    #[error("Patch generator rejected the credential")]
    InvalidCredential,

    #[error("Patch generator is not configured: {0}")]
    NotConfigured(String),

    #[error("Patch generator returned an unusable response: {0}")]
    MalformedResponse(String),

    #[error("Patch generator produced no patch{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    NoPatch { reason: Option<String> },

    #[error("Patch generator repeated an already attempted patch")]
    RepeatedPatch,
}

/// Errors raised while writing or restoring patched files
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{path}: {source}")]
    Conflict {
        path: String,
        #[source]
        source: HunkConflict,
    },

    #[error("{path}: target file does not exist")]
    MissingTarget { path: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A patch is already applied and awaiting verification")]
    PatchAlreadyPending,

    #[error("No applied patch to revert or commit")]
    NothingPending,
}

/// Workspace lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another fix loop holds the workspace lock at {}", .0.display())]
    Busy(PathBuf),

    #[error("Failed to open lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Summary of the run that led to an abort, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub signature: Option<String>,
    pub output_tail: String,
}

impl RunContext {
    pub fn new(run: &Run, signature: Option<&ErrorSignature>) -> Self {
        Self {
            command: run.command().to_string(),
            exit_code: run.exit_code(),
            timed_out: run.is_timed_out(),
            signature: signature.map(ToString::to_string),
            output_tail: run.output_tail(20),
        }
    }
}

impl fmt::Display for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.command)?;
        match (self.timed_out, self.exit_code) {
            (true, _) => write!(f, " timed out")?,
            (false, Some(code)) => write!(f, " exited {code}")?,
            (false, None) => write!(f, " was killed")?,
        }
        if let Some(signature) = &self.signature {
            write!(f, " ({signature})")?;
        }
        Ok(())
    }
}

/// Every way a fix loop can end without resolving the error.
///
/// Each variant carries enough of the triggering run to report it, and maps to
/// a distinct process exit code.
#[derive(Debug, Error)]
pub enum FixLoopError {
    #[error("Patch generation failed for {context}: {source}")]
    PatchGeneration {
        #[source]
        source: GenerationError,
        context: RunContext,
    },

    #[error("Patch rejected for {context}{}", .violation.as_ref().map(|v| format!(": {v}")).unwrap_or_default())]
    Rejected {
        violation: Option<PolicyViolation>,
        context: RunContext,
    },

    #[error("Patch does not apply cleanly for {context}: {source}")]
    ApplyConflict {
        #[source]
        source: ApplyError,
        context: RunContext,
    },

    #[error("Verification failed ({result}); original {original}, after patch {after}")]
    VerificationRegression {
        result: VerificationResult,
        original: RunContext,
        after: RunContext,
    },

    #[error("Command {context} after {timeout_secs}s")]
    ExecutionTimeout { timeout_secs: u64, context: RunContext },

    #[error("Retry budget exhausted after {attempts} attempts for {context}")]
    RetryBudgetExhausted { attempts: u32, context: RunContext },

    #[error("Failed to apply patch: {0}")]
    Apply(#[from] ApplyError),

    #[error("Fix memory error: {0}")]
    Store(#[from] StoreError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] LockError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecError),
}

impl FixLoopError {
    /// Process exit code for this failure.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Rejected { .. } => 2,
            Self::RetryBudgetExhausted { .. } => 3,
            Self::VerificationRegression { .. } => 4,
            // Unreachable, or answered with nothing applicable
            Self::PatchGeneration { .. } => 5,
            Self::ApplyConflict { .. } => 6,
            Self::ExecutionTimeout { .. } => 7,
            Self::Apply(_)
            | Self::Store(_)
            | Self::Workspace(_)
            | Self::Execution(_) => 1,
        }
    }
}
