use crate::domain::models::{Patch, PolicyViolation};
use async_trait::async_trait;

/// Why a human is being asked.
#[derive(Debug, Clone, Copy)]
pub enum ApprovalPrompt<'a> {
    /// The diff guard blocked the patch
    Blocked(&'a PolicyViolation),
    /// The guard passed it but auto-apply is off
    Confirm,
}

/// A human's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAnswer {
    Approve,
    Reject,
    /// No answer: stdin closed, interrupted, or no terminal available
    Cancelled,
}

/// Asks a human whether a patch may be applied.
///
/// Implementations may block on user input; the loop enforces any configured
/// timeout and treats everything but [`ApprovalAnswer::Approve`] as rejection.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request(&self, patch: &Patch, prompt: ApprovalPrompt<'_>) -> ApprovalAnswer;
}
