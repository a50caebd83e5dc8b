use serde::{Deserialize, Serialize};
use std::fmt;

use super::signature::ErrorSignature;

/// Why a failed verification could not be compared with the original error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnrelatedReason {
    Timeout,
    Unclassified,
}

/// Outcome of re-running the command after a patch was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum VerificationResult {
    Pass,
    FailSameError,
    FailNewError { signature: ErrorSignature },
    FailUnrelated { reason: UnrelatedReason },
}

impl VerificationResult {
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::FailSameError => write!(f, "same error persists"),
            Self::FailNewError { signature } => write!(f, "new error: {signature}"),
            Self::FailUnrelated {
                reason: UnrelatedReason::Timeout,
            } => write!(f, "verification timed out"),
            Self::FailUnrelated {
                reason: UnrelatedReason::Unclassified,
            } => write!(f, "unrecognized failure"),
        }
    }
}
