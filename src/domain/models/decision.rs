//! Guard outcomes and the approved-patch gate.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::patch::Patch;

/// Why a path falls outside the patch's allowed scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeReason {
    AbsolutePath,
    ParentTraversal,
    OutsideRoot,
    MissingFile,
    CreatesFile,
    DeletesFile,
    RenamesFile,
}

impl fmt::Display for ScopeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AbsolutePath => "absolute path",
            Self::ParentTraversal => "path escapes through '..'",
            Self::OutsideRoot => "resolves outside the project root",
            Self::MissingFile => "file does not exist",
            Self::CreatesFile => "creates a new file",
            Self::DeletesFile => "deletes a file",
            Self::RenamesFile => "renames a file",
        };
        f.write_str(text)
    }
}

/// A guard rule the patch broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PolicyViolation {
    ScopeViolation { path: String, reason: ScopeReason },
    OversizedDiff { changed_lines: usize, ceiling: usize },
    SensitivePath { path: String, pattern: String },
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScopeViolation { path, reason } => write!(f, "{path}: {reason}"),
            Self::OversizedDiff {
                changed_lines,
                ceiling,
            } => write!(f, "diff changes {changed_lines} lines, limit is {ceiling}"),
            Self::SensitivePath { path, pattern } => {
                write!(f, "{path} matches sensitive pattern '{pattern}'")
            }
        }
    }
}

/// Outcome of evaluating a candidate patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    AutoApproved,
    ApprovedByUser,
    Rejected,
    BlockedByPolicy { violation: PolicyViolation },
}

impl ApprovalDecision {
    /// Whether this decision allows the patch to be written.
    pub const fn permits_apply(&self) -> bool {
        matches!(self, Self::AutoApproved | Self::ApprovedByUser)
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoApproved => write!(f, "auto-approved"),
            Self::ApprovedByUser => write!(f, "approved by user"),
            Self::Rejected => write!(f, "rejected"),
            Self::BlockedByPolicy { violation } => write!(f, "blocked: {violation}"),
        }
    }
}

/// A patch paired with a decision that permits applying it.
///
/// The only way to build one is [`ApprovedPatch::new`], which refuses
/// rejected or blocked decisions. The patch is owned and never handed out
/// mutably, so the approval stays bound to the reviewed content.
#[derive(Debug, Clone)]
pub struct ApprovedPatch {
    patch: Patch,
    decision: ApprovalDecision,
}

impl ApprovedPatch {
    /// Returns the patch back when the decision does not permit applying it.
    pub fn new(patch: Patch, decision: ApprovalDecision) -> Result<Self, (Patch, ApprovalDecision)> {
        if decision.permits_apply() {
            Ok(Self { patch, decision })
        } else {
            Err((patch, decision))
        }
    }

    pub const fn patch(&self) -> &Patch {
        &self.patch
    }

    pub const fn decision(&self) -> &ApprovalDecision {
        &self.decision
    }

    pub fn into_patch(self) -> Patch {
        self.patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::patch::PatchOrigin;

    fn patch() -> Patch {
        Patch::parse("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n+b\n", PatchOrigin::Generated).unwrap()
    }

    #[test]
    fn test_only_approving_decisions_build_approved_patch() {
        assert!(ApprovedPatch::new(patch(), ApprovalDecision::AutoApproved).is_ok());
        assert!(ApprovedPatch::new(patch(), ApprovalDecision::ApprovedByUser).is_ok());
        assert!(ApprovedPatch::new(patch(), ApprovalDecision::Rejected).is_err());

        let blocked = ApprovalDecision::BlockedByPolicy {
            violation: PolicyViolation::OversizedDiff {
                changed_lines: 500,
                ceiling: 60,
            },
        };
        let (returned, decision) = ApprovedPatch::new(patch(), blocked.clone()).unwrap_err();
        assert_eq!(returned, patch());
        assert_eq!(decision, blocked);
    }

    #[test]
    fn test_violation_display() {
        let violation = PolicyViolation::SensitivePath {
            path: ".env".to_string(),
            pattern: ".env*".to_string(),
        };
        assert_eq!(violation.to_string(), ".env matches sensitive pattern '.env*'");
    }
}
