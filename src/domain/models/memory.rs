use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::signature::Frame;
use super::verification::VerificationResult;

/// A verified fix, keyed by error fingerprint.
///
/// `patch` holds the normalized diff text exactly as it was applied, so a
/// replay reproduces the same change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub fingerprint: String,
    pub error_class: String,
    pub top_frame: Option<Frame>,
    pub patch: String,
    pub success_count: u32,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Outcome details passed along with a fix being recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub verification: VerificationResult,
    pub recorded_at: DateTime<Utc>,
}

impl RecordMeta {
    /// Metadata for a fix that just passed verification.
    pub fn passed_now() -> Self {
        Self {
            verification: VerificationResult::Pass,
            recorded_at: Utc::now(),
        }
    }
}
