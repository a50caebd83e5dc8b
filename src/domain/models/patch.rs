//! Unified diff patches.
//!
//! A [`Patch`] is the parsed form of a multi-file unified diff. Parsing is
//! count-driven: every hunk body is read exactly as long as its header says,
//! so removed lines that happen to start with `--` are not mistaken for file
//! headers. Applying hunks to text lives here too, as a pure transformation;
//! touching the filesystem is the patch applier's job.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

use super::signature::hex_digest;

#[allow(clippy::expect_used)]
static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex is valid")
});

/// Errors raised while parsing diff text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchParseError {
    #[error("diff contains no file changes")]
    Empty,

    #[error("invalid hunk header at line {line}: {header}")]
    InvalidHunkHeader { line: usize, header: String },

    #[error("hunk starting at line {line} ends before its declared length")]
    TruncatedHunk { line: usize },

    #[error("unexpected line {line} inside hunk: {content}")]
    UnexpectedLine { line: usize, content: String },

    #[error("file header for {path} has no hunks")]
    MissingHunks { path: String },

    #[error("file header at line {line} has /dev/null on both sides")]
    NoPath { line: usize },
}

/// A hunk could not be located in the target file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("hunk {hunk} (original line {line}) does not match the file contents")]
pub struct HunkConflict {
    pub hunk: usize,
    pub line: usize,
}

/// Where a candidate patch came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchOrigin {
    /// Freshly produced by the patch generator.
    Generated,
    /// Replayed from a memory entry keyed by `fingerprint`.
    ReplayedFromMemory { fingerprint: String },
}

impl fmt::Display for PatchOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generated => write!(f, "generated"),
            Self::ReplayedFromMemory { fingerprint } => {
                let short = fingerprint.get(..12).unwrap_or(fingerprint);
                write!(f, "memory {short}")
            }
        }
    }
}

/// A single line in a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// (additions, deletions)
    pub fn summary(&self) -> (usize, usize) {
        self.lines.iter().fold((0, 0), |(adds, removes), line| match line {
            DiffLine::Add(_) => (adds + 1, removes),
            DiffLine::Remove(_) => (adds, removes + 1),
            DiffLine::Context(_) => (adds, removes),
        })
    }

    fn expected(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                DiffLine::Context(text) | DiffLine::Remove(text) => Some(text.as_str()),
                DiffLine::Add(_) => None,
            })
            .collect()
    }

    fn replacement(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            DiffLine::Context(text) | DiffLine::Add(text) => Some(text.as_str()),
            DiffLine::Remove(_) => None,
        })
    }
}

/// Changes to one file. `None` on either side means `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// The path this file patch touches.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub const fn is_creation(&self) -> bool {
        self.old_path.is_none()
    }

    pub const fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }

    /// True when the diff moves a file under a different name.
    pub fn is_rename(&self) -> bool {
        matches!((&self.old_path, &self.new_path), (Some(old), Some(new)) if old != new)
    }

    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, hunk| {
            let (adds, removes) = hunk.summary();
            (acc.0 + adds, acc.1 + removes)
        })
    }

    /// Apply every hunk to `original` and return the new contents.
    ///
    /// Hunks are located at their declared position first and then searched
    /// outward, the way `patch` tolerates offsets. Trailing whitespace is not
    /// significant when matching. Line endings and the presence of a final
    /// newline follow the original file.
    pub fn apply_to(&self, original: &str) -> Result<String, HunkConflict> {
        let eol = if original.contains("\r\n") { "\r\n" } else { "\n" };
        let trailing_newline = original.is_empty() || original.ends_with('\n');
        let lines: Vec<&str> = original.lines().collect();

        let mut out: Vec<&str> = Vec::with_capacity(lines.len());
        let mut cursor = 0usize;

        for (index, hunk) in self.hunks.iter().enumerate() {
            let expected = hunk.expected();
            let preferred = if hunk.old_count == 0 {
                hunk.old_start
            } else {
                hunk.old_start.saturating_sub(1)
            };
            let pos = locate(&lines, &expected, preferred, cursor).ok_or(HunkConflict {
                hunk: index + 1,
                line: hunk.old_start,
            })?;

            out.extend_from_slice(&lines[cursor..pos]);
            out.extend(hunk.replacement());
            cursor = pos + expected.len();
        }
        out.extend_from_slice(&lines[cursor..]);

        let mut result = out.join(eol);
        if trailing_newline && !out.is_empty() {
            result.push_str(eol);
        }
        Ok(result)
    }
}

/// Find where `expected` occurs in `lines` at or after `floor`, nearest to `preferred`.
fn locate(lines: &[&str], expected: &[&str], preferred: usize, floor: usize) -> Option<usize> {
    let last_start = lines.len().checked_sub(expected.len())?;
    if last_start < floor {
        return None;
    }
    let preferred = preferred.clamp(floor, last_start);
    let matches_at = |start: usize| {
        expected
            .iter()
            .zip(&lines[start..start + expected.len()])
            .all(|(want, have)| want.trim_end() == have.trim_end())
    };

    let span = (preferred - floor).max(last_start - preferred);
    for distance in 0..=span {
        if let Some(start) = preferred.checked_sub(distance) {
            if start >= floor && matches_at(start) {
                return Some(start);
            }
        }
        let start = preferred + distance;
        if distance > 0 && start <= last_start && matches_at(start) {
            return Some(start);
        }
    }
    None
}

/// A parsed, content-addressed unified diff.
///
/// The digest covers the normalized diff text, so approval and memory
/// bookkeeping can refer to the exact content that was reviewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    files: Vec<FilePatch>,
    raw: String,
    digest: String,
    origin: PatchOrigin,
}

impl Patch {
    /// Parse unified diff text.
    ///
    /// Anything outside file headers and hunks (`diff --git`, `index`, mode
    /// lines, prose) is ignored.
    pub fn parse(text: &str, origin: PatchOrigin) -> Result<Self, PatchParseError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut files = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let is_header = lines[i].starts_with("--- ")
                && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "));
            if !is_header {
                i += 1;
                continue;
            }

            let old_path = parse_header_path(&lines[i][4..]);
            let new_path = parse_header_path(&lines[i + 1][4..]);
            if old_path.is_none() && new_path.is_none() {
                return Err(PatchParseError::NoPath { line: i + 1 });
            }
            i += 2;

            let mut hunks = Vec::new();
            while i < lines.len() && lines[i].starts_with("@@") {
                hunks.push(parse_hunk(&lines, &mut i)?);
            }

            let file = FilePatch {
                old_path,
                new_path,
                hunks,
            };
            if file.hunks.is_empty() {
                return Err(PatchParseError::MissingHunks {
                    path: file.path().to_string(),
                });
            }
            files.push(file);
        }

        if files.is_empty() {
            return Err(PatchParseError::Empty);
        }

        let mut raw = lines.join("\n");
        raw.push('\n');
        let digest = digest_text(&raw);

        Ok(Self {
            files,
            raw,
            digest,
            origin,
        })
    }

    pub fn files(&self) -> &[FilePatch] {
        &self.files
    }

    /// Normalized diff text, `\n` line endings with a final newline.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Hex SHA-256 of [`Patch::raw`].
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub const fn origin(&self) -> &PatchOrigin {
        &self.origin
    }

    /// Total added plus removed lines across all files.
    pub fn changed_lines(&self) -> usize {
        self.files
            .iter()
            .map(|file| {
                let (adds, removes) = file.stats();
                adds + removes
            })
            .sum()
    }

    /// Every path the patch reads or writes.
    pub fn target_files(&self) -> BTreeSet<&str> {
        self.files
            .iter()
            .flat_map(|file| [file.old_path.as_deref(), file.new_path.as_deref()])
            .flatten()
            .collect()
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn digest_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_digest(hasher)
}

fn parse_header_path(rest: &str) -> Option<String> {
    let path = rest.split('\t').next().unwrap_or_default().trim();
    if path == "/dev/null" {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

fn parse_hunk(lines: &[&str], i: &mut usize) -> Result<Hunk, PatchParseError> {
    let header_line = *i + 1;
    let header = lines[*i];
    let caps = HUNK_HEADER
        .captures(header)
        .ok_or_else(|| PatchParseError::InvalidHunkHeader {
            line: header_line,
            header: header.to_string(),
        })?;
    let number = |idx: usize, default: usize| -> Result<usize, PatchParseError> {
        caps.get(idx).map_or(Ok(default), |m| {
            m.as_str()
                .parse()
                .map_err(|_| PatchParseError::InvalidHunkHeader {
                    line: header_line,
                    header: header.to_string(),
                })
        })
    };
    let old_start = number(1, 0)?;
    let old_count = number(2, 1)?;
    let new_start = number(3, 0)?;
    let new_count = number(4, 1)?;
    *i += 1;

    let mut body = Vec::new();
    let (mut old_seen, mut new_seen) = (0usize, 0usize);
    while old_seen < old_count || new_seen < new_count {
        let Some(line) = lines.get(*i) else {
            return Err(PatchParseError::TruncatedHunk { line: header_line });
        };
        match line.chars().next() {
            None => {
                body.push(DiffLine::Context(String::new()));
                old_seen += 1;
                new_seen += 1;
            }
            Some(' ') => {
                body.push(DiffLine::Context(line[1..].to_string()));
                old_seen += 1;
                new_seen += 1;
            }
            Some('-') => {
                body.push(DiffLine::Remove(line[1..].to_string()));
                old_seen += 1;
            }
            Some('+') => {
                body.push(DiffLine::Add(line[1..].to_string()));
                new_seen += 1;
            }
            Some('\\') => {}
            Some(_) => {
                return Err(PatchParseError::UnexpectedLine {
                    line: *i + 1,
                    content: (*line).to_string(),
                });
            }
        }
        *i += 1;
    }
    if old_seen != old_count || new_seen != new_count {
        return Err(PatchParseError::TruncatedHunk { line: header_line });
    }
    // "\ No newline at end of file" after the last body line
    while lines.get(*i).is_some_and(|line| line.starts_with('\\')) {
        *i += 1;
    }

    Ok(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: body,
    })
}
