use crate::domain::errors::GenerationError;
use crate::domain::models::{ErrorSignature, VerificationResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything the generator gets to see about a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRequest {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub signature: ErrorSignature,
    /// Contents of the files the failure points at
    pub files: Vec<FileContext>,
    /// Patches already tried in this loop, oldest first
    pub prior_attempts: Vec<PriorAttempt>,
    /// Diffs that fixed related errors before
    pub memory_hints: Vec<String>,
}

/// A project file included as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContext {
    pub path: String,
    pub contents: String,
    pub truncated: bool,
}

/// A patch that was applied and failed verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorAttempt {
    pub diff: String,
    pub result: VerificationResult,
}

/// What the generator answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchResponse {
    /// Unified diff text, not yet parsed
    Diff(String),
    /// The generator declined to propose a change
    NoPatch { reason: Option<String> },
}

/// Produces candidate diffs for a failure.
///
/// The loop treats this as untrusted: every answer goes through parsing and
/// the diff guard before anything is written.
#[async_trait]
pub trait PatchGenerator: Send + Sync {
    async fn generate(&self, request: &PatchRequest) -> Result<PatchResponse, GenerationError>;
}
