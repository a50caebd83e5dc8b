//! Safety policy for candidate patches.
//!
//! The guard decides, without writing anything, whether a patch may be applied
//! automatically. Rules are checked in a fixed order and the first violation
//! is reported:
//!
//! 1. Scope: every touched path must be a relative path to an existing file
//!    that resolves inside the project root. Creating, deleting, or renaming
//!    files is out of scope.
//! 2. Size: added plus removed lines must not exceed the ceiling.
//! 3. Sensitivity: no touched path may match a sensitive pattern.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::domain::models::{ApprovalDecision, FilePatch, Patch, PolicyViolation, ScopeReason};

#[derive(Debug, Error)]
pub enum GuardConfigError {
    #[error("Invalid sensitive path pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Project root {} is not accessible: {source}", .root.display())]
    InvalidRoot {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Compiled set of glob patterns.
///
/// `*` and `?` stay within one path segment, `**` spans segments. A pattern
/// without a `/` matches the file name at any depth, so `.env` also catches
/// `services/api/.env`.
#[derive(Debug, Clone)]
pub struct SensitivePathSet {
    patterns: Vec<(String, Regex)>,
}

impl SensitivePathSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, GuardConfigError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(&glob_to_regex(pattern))
                    .map(|re| (pattern.to_string(), re))
                    .map_err(|source| GuardConfigError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    /// The first pattern `path` matches.
    pub fn matching(&self, path: &str) -> Option<&str> {
        let path = path.trim_start_matches("./");
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(path))
            .map(|(pattern, _)| pattern.as_str())
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    if !glob.contains('/') {
        out.push_str("(?:.*/)?");
    }
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            ch => out.push_str(&regex::escape(&ch.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Policy the guard enforces for one project.
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    root: PathBuf,
    max_changed_lines: usize,
    sensitive: SensitivePathSet,
}

impl GuardPolicy {
    pub fn new<S: AsRef<str>>(
        root: &Path,
        max_changed_lines: usize,
        sensitive_paths: &[S],
    ) -> Result<Self, GuardConfigError> {
        let root = root
            .canonicalize()
            .map_err(|source| GuardConfigError::InvalidRoot {
                root: root.to_path_buf(),
                source,
            })?;
        Ok(Self {
            root,
            max_changed_lines,
            sensitive: SensitivePathSet::new(sensitive_paths)?,
        })
    }

    pub const fn max_changed_lines(&self) -> usize {
        self.max_changed_lines
    }

    /// Decide whether `patch` may be applied without a human.
    ///
    /// Only reads file metadata; never writes.
    pub fn evaluate(&self, patch: &Patch) -> ApprovalDecision {
        let violation = patch
            .files()
            .iter()
            .find_map(|file| self.check_scope(file))
            .or_else(|| self.check_size(patch))
            .or_else(|| self.check_sensitive(patch));

        match violation {
            Some(violation) => {
                tracing::info!(%violation, digest = %patch.digest(), "patch blocked by guard");
                ApprovalDecision::BlockedByPolicy { violation }
            }
            None => ApprovalDecision::AutoApproved,
        }
    }

    fn check_scope(&self, file: &FilePatch) -> Option<PolicyViolation> {
        let scope = |path: &str, reason| PolicyViolation::ScopeViolation {
            path: path.to_string(),
            reason,
        };

        for path in [file.old_path.as_deref(), file.new_path.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some(reason) = self.path_reason(path) {
                return Some(scope(path, reason));
            }
        }

        if file.is_creation() {
            return Some(scope(file.path(), ScopeReason::CreatesFile));
        }
        if file.is_deletion() {
            return Some(scope(file.path(), ScopeReason::DeletesFile));
        }
        if file.is_rename() {
            return Some(scope(file.path(), ScopeReason::RenamesFile));
        }
        None
    }

    fn path_reason(&self, path: &str) -> Option<ScopeReason> {
        let candidate = Path::new(path);
        let looks_absolute = candidate.has_root()
            || candidate.is_absolute()
            || path.as_bytes().get(1) == Some(&b':');
        if looks_absolute {
            return Some(ScopeReason::AbsolutePath);
        }
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Some(ScopeReason::ParentTraversal);
        }

        match self.root.join(candidate).canonicalize() {
            Ok(resolved) if !resolved.starts_with(&self.root) => Some(ScopeReason::OutsideRoot),
            Ok(resolved) if resolved.is_file() => None,
            _ => Some(ScopeReason::MissingFile),
        }
    }

    fn check_size(&self, patch: &Patch) -> Option<PolicyViolation> {
        let changed_lines = patch.changed_lines();
        (changed_lines > self.max_changed_lines).then(|| PolicyViolation::OversizedDiff {
            changed_lines,
            ceiling: self.max_changed_lines,
        })
    }

    fn check_sensitive(&self, patch: &Patch) -> Option<PolicyViolation> {
        patch.target_files().into_iter().find_map(|path| {
            self.sensitive
                .matching(path)
                .map(|pattern| PolicyViolation::SensitivePath {
                    path: path.to_string(),
                    pattern: pattern.to_string(),
                })
        })
    }
}
