//! Error signatures and their fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A source location, with the path relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub file: String,
    pub line: u32,
}

impl Frame {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Normalized description of a failure.
///
/// The fingerprint is derived from the error class and the top frame only, so
/// two runs that fail the same way at the same place share it even when the
/// message text differs (addresses, timestamps, ids). A signature without a
/// frame falls back to the normalized message to keep unrelated frame-less
/// failures apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignature {
    class: String,
    message: String,
    frame: Option<Frame>,
    related_files: Vec<String>,
    recognized: bool,
    fingerprint: String,
}

impl ErrorSignature {
    /// Signature for a failure a known pattern matched.
    pub fn new(
        class: impl Into<String>,
        message: impl Into<String>,
        frame: Option<Frame>,
        related_files: Vec<String>,
    ) -> Self {
        Self::build(class.into(), message.into(), frame, related_files, true)
    }

    /// Signature for a non-zero exit no pattern recognized.
    pub fn unrecognized(exit_code: Option<i32>, last_line: &str) -> Self {
        let class = exit_code.map_or_else(
            || "TerminatedBySignal".to_string(),
            |code| format!("ExitStatus({code})"),
        );
        Self::build(class, last_line.trim().to_string(), None, Vec::new(), false)
    }

    fn build(
        class: String,
        message: String,
        frame: Option<Frame>,
        related_files: Vec<String>,
        recognized: bool,
    ) -> Self {
        let fingerprint = compute_fingerprint(&class, frame.as_ref(), &message);
        Self {
            class,
            message,
            frame,
            related_files,
            recognized,
            fingerprint,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Innermost frame, preferring frames inside the project root.
    pub const fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Every in-project file the failure output mentioned, most relevant first.
    pub fn related_files(&self) -> &[String] {
        &self.related_files
    }

    /// False when this signature is a fallback for unparseable output.
    pub const fn is_recognized(&self) -> bool {
        self.recognized
    }

    /// Stable hex SHA-256 identity used as the memory key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.frame {
            Some(frame) => write!(f, "{} at {}", self.class, frame),
            None => write!(f, "{}", self.class),
        }
    }
}

fn compute_fingerprint(class: &str, frame: Option<&Frame>, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(class.as_bytes());
    hasher.update(b"\n");
    match frame {
        Some(frame) => {
            hasher.update(frame.file.as_bytes());
            hasher.update(b"\n");
            hasher.update(frame.line.to_string().as_bytes());
        }
        None => {
            hasher.update(b"\n");
            hasher.update(normalize_message(message).as_bytes());
        }
    }
    hex_digest(hasher)
}

/// Lowercase hex encoding of a finished SHA-256 hasher.
pub(crate) fn hex_digest(hasher: Sha256) -> String {
    use std::fmt::Write;

    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Replace volatile tokens so cosmetic differences do not split fingerprints.
fn normalize_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_digits = false;
    for ch in message.trim().chars() {
        if ch.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
        } else {
            in_digits = false;
            out.push(ch.to_ascii_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_message_when_frame_present() {
        let a = ErrorSignature::new("KeyError", "'user_42'", Some(Frame::new("app.py", 12)), vec![]);
        let b = ErrorSignature::new("KeyError", "'user_77'", Some(Frame::new("app.py", 12)), vec![]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_differs_by_location() {
        let a = ErrorSignature::new("KeyError", "", Some(Frame::new("app.py", 12)), vec![]);
        let b = ErrorSignature::new("KeyError", "", Some(Frame::new("app.py", 13)), vec![]);
        let c = ErrorSignature::new("KeyError", "", Some(Frame::new("lib.py", 12)), vec![]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_differs_by_class() {
        let a = ErrorSignature::new("KeyError", "", Some(Frame::new("app.py", 12)), vec![]);
        let b = ErrorSignature::new("TypeError", "", Some(Frame::new("app.py", 12)), vec![]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_frameless_fingerprint_normalizes_numbers() {
        let a = ErrorSignature::unrecognized(Some(2), "failed after 120ms");
        let b = ErrorSignature::unrecognized(Some(2), "failed after 95ms");
        let c = ErrorSignature::unrecognized(Some(2), "disk full");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(!a.is_recognized());
        assert_eq!(a.class(), "ExitStatus(2)");
    }

    #[test]
    fn test_display() {
        let sig = ErrorSignature::new("panic", "boom", Some(Frame::new("src/lib.rs", 9)), vec![]);
        assert_eq!(sig.to_string(), "panic at src/lib.rs:9");
    }
}
