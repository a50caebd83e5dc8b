//! Failure output parsing.
//!
//! Turns the text a failing command printed into an [`ErrorSignature`]. Each
//! supported toolchain has its own matcher; they are tried in a fixed order and
//! the first that recognizes the output wins. Frames are normalized to paths
//! relative to the project root, and frames inside the project are preferred
//! over library or runtime frames when picking the top frame.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::domain::models::{ErrorSignature, Frame, Run};

macro_rules! regex {
    ($name:ident, $pattern:expr) => {
        #[allow(clippy::expect_used)]
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect(concat!(stringify!($name), " is valid")));
    };
}

regex!(PY_FRAME, r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)"#);
regex!(
    PY_EXCEPTION,
    r"^(?:E\s+)?(?P<class>[A-Za-z_][\w.]*(?:Error|Exception|Exit|Interrupt|Warning|Failure))(?::\s?(?P<msg>.*))?$"
);
regex!(PYTEST_LOCATION, r"^(?P<file>[^\s:]+\.py):(?P<line>\d+): (?P<class>[A-Za-z_][\w.]*)$");
regex!(
    RUST_PANIC,
    r"thread '[^']*' panicked at (?:'(?P<old_msg>.*)', )?(?P<file>[^\s:]+):(?P<line>\d+):\d+"
);
regex!(RUSTC_ERROR, r"^error(?:\[(?P<code>E\d{4})\])?: (?P<msg>.+)$");
regex!(RUSTC_LOCATION, r"^\s*--> (?P<file>[^\s:]+):(?P<line>\d+):\d+");
regex!(
    JS_ERROR,
    r"^(?:Uncaught )?(?P<class>[A-Z][A-Za-z]*Error)(?: \[[A-Z_]+\])?: (?P<msg>.*)$"
);
regex!(
    JS_FRAME,
    r"^\s+at (?:.*? \()?(?:file://)?(?P<file>[^\s()]+?):(?P<line>\d+):\d+\)?$"
);
regex!(GO_PANIC, r"^panic: (?P<msg>.+)$");
regex!(GO_FRAME, r"^\s+(?P<file>\S+\.go):(?P<line>\d+)");
regex!(
    TSC_ERROR,
    r"^(?P<file>[^\s(]+)\((?P<line>\d+),\d+\): error (?P<code>TS\d+): (?P<msg>.*)$"
);
regex!(
    COMPILER_ERROR,
    r"^(?P<file>[^\s:]+\.\w+):(?P<line>\d+)(?::\d+)?:\s*(?:fatal )?error(?:\[[\w-]+\])?:?\s*(?P<msg>.*)$"
);
regex!(
    GENERIC_CLASS,
    r"\b(?P<class>[A-Z][A-Za-z]*(?:Error|Exception))\b:?\s*(?P<msg>.*)$"
);
regex!(GENERIC_LOCATION, r"(?P<file>[\w./\\-]+\.[A-Za-z]\w*):(?P<line>\d+)");

/// Path fragments that mark a frame as library or runtime code.
const FOREIGN_MARKERS: &[&str] = &[
    "site-packages/",
    "dist-packages/",
    "node_modules/",
    "node:internal",
    "/rustc/",
    ".cargo/registry/",
    "/usr/lib/",
    "/usr/local/lib/",
    "<frozen",
    "<string>",
];

/// A match before path normalization.
struct RawFailure {
    class: String,
    message: String,
    /// Innermost frame first
    frames: Vec<(String, u32)>,
}

/// Extracts error signatures relative to a project root.
#[derive(Debug, Clone)]
pub struct SignatureExtractor {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
}

impl SignatureExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let canonical_root = root.canonicalize().ok();
        Self {
            root,
            canonical_root,
        }
    }

    /// Signature of a failed run, `None` for successful or timed-out runs and
    /// for output no matcher recognizes.
    pub fn extract(&self, run: &Run) -> Option<ErrorSignature> {
        if run.succeeded() || run.is_timed_out() {
            return None;
        }
        self.parse_output(&format!("{}\n{}", run.stderr(), run.stdout()))
    }

    /// Like [`SignatureExtractor::extract`], falling back to an unrecognized
    /// signature built from the exit status and last output line.
    pub fn extract_or_fallback(&self, run: &Run) -> Option<ErrorSignature> {
        if run.succeeded() || run.is_timed_out() {
            return None;
        }
        self.extract(run).or_else(|| {
            let tail = run.output_tail(1);
            Some(ErrorSignature::unrecognized(run.exit_code(), &tail))
        })
    }

    /// Parse raw failure output.
    pub fn parse_output(&self, text: &str) -> Option<ErrorSignature> {
        let raw = parse_python(text)
            .or_else(|| parse_rust_panic(text))
            .or_else(|| parse_rustc(text))
            .or_else(|| parse_js(text))
            .or_else(|| parse_go(text))
            .or_else(|| parse_compiler(text))
            .or_else(|| parse_generic(text))?;
        Some(self.finish(raw))
    }

    fn finish(&self, raw: RawFailure) -> ErrorSignature {
        let normalized: Vec<(Frame, bool)> = raw
            .frames
            .iter()
            .map(|(file, line)| {
                let (path, in_project) = self.normalize_path(file);
                (Frame::new(path, *line), in_project)
            })
            .collect();

        let top = normalized
            .iter()
            .find(|(_, in_project)| *in_project)
            .or_else(|| normalized.first())
            .map(|(frame, _)| frame.clone());

        let mut related: Vec<String> = Vec::new();
        for (frame, in_project) in &normalized {
            if *in_project && !related.contains(&frame.file) {
                related.push(frame.file.clone());
            }
        }

        ErrorSignature::new(raw.class, raw.message.trim(), top, related)
    }

    /// Root-relative, `/`-separated path and whether it belongs to the project.
    fn normalize_path(&self, raw: &str) -> (String, bool) {
        let cleaned = raw.trim().replace('\\', "/");
        let foreign = FOREIGN_MARKERS.iter().any(|marker| cleaned.contains(marker));
        let path = Path::new(&cleaned);

        if path.is_absolute() {
            let relative = [Some(&self.root), self.canonical_root.as_ref()]
                .into_iter()
                .flatten()
                .find_map(|root| path.strip_prefix(root).ok());
            return match relative {
                Some(rel) => (to_slash(rel), !foreign),
                None => (cleaned, false),
            };
        }

        let trimmed = cleaned.trim_start_matches("./").to_string();
        let escapes = trimmed.starts_with("../") || trimmed.starts_with('<');
        (trimmed, !foreign && !escapes)
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn capture_line(caps: &regex::Captures<'_>) -> Option<u32> {
    caps.name("line")?.as_str().parse().ok()
}

fn parse_python(text: &str) -> Option<RawFailure> {
    let mut frames = Vec::new();
    let mut class = None;
    for line in text.lines() {
        if let Some(caps) = PY_FRAME.captures(line) {
            if let Some(n) = capture_line(&caps) {
                frames.push((caps["file"].to_string(), n));
            }
        } else if let Some(caps) = PYTEST_LOCATION.captures(line) {
            if let Some(n) = capture_line(&caps) {
                frames.push((caps["file"].to_string(), n));
            }
        } else if let Some(caps) = PY_EXCEPTION.captures(line.trim_end()) {
            let message = caps.name("msg").map_or("", |m| m.as_str()).to_string();
            class = Some((caps["class"].to_string(), message));
        }
    }
    if frames.is_empty() {
        return None;
    }
    let (class, message) = class?;
    // Tracebacks list the innermost call last
    frames.reverse();
    Some(RawFailure {
        class,
        message,
        frames,
    })
}

fn parse_rust_panic(text: &str) -> Option<RawFailure> {
    let lines: Vec<&str> = text.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = RUST_PANIC.captures(line) else {
            continue;
        };
        let message = caps.name("old_msg").map_or_else(
            || lines.get(idx + 1).map_or("", |next| next.trim()).to_string(),
            |m| m.as_str().to_string(),
        );
        return Some(RawFailure {
            class: "panic".to_string(),
            message,
            frames: capture_line(&caps)
                .map(|n| vec![(caps["file"].to_string(), n)])
                .unwrap_or_default(),
        });
    }
    None
}

fn parse_rustc(text: &str) -> Option<RawFailure> {
    let lines: Vec<&str> = text.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = RUSTC_ERROR.captures(line) else {
            continue;
        };
        let message = caps["msg"].to_string();
        if message.starts_with("could not compile") || message.starts_with("aborting due to") {
            continue;
        }
        let location = lines
            .iter()
            .skip(idx + 1)
            .take(4)
            .find_map(|next| RUSTC_LOCATION.captures(next));
        let Some(location) = location else {
            continue;
        };
        let class = caps
            .name("code")
            .map_or_else(|| "rustc".to_string(), |code| format!("rustc {}", code.as_str()));
        return Some(RawFailure {
            class,
            message,
            frames: capture_line(&location)
                .map(|n| vec![(location["file"].to_string(), n)])
                .unwrap_or_default(),
        });
    }
    None
}

fn parse_js(text: &str) -> Option<RawFailure> {
    let lines: Vec<&str> = text.lines().collect();
    let (idx, caps) = lines
        .iter()
        .enumerate()
        .find_map(|(idx, line)| JS_ERROR.captures(line.trim_end()).map(|caps| (idx, caps)))?;
    let frames: Vec<(String, u32)> = lines
        .iter()
        .skip(idx + 1)
        .filter_map(|line| JS_FRAME.captures(line))
        .filter_map(|frame| capture_line(&frame).map(|n| (frame["file"].to_string(), n)))
        .collect();
    if frames.is_empty() {
        return None;
    }
    Some(RawFailure {
        class: caps["class"].to_string(),
        message: caps["msg"].to_string(),
        frames,
    })
}

fn parse_go(text: &str) -> Option<RawFailure> {
    let lines: Vec<&str> = text.lines().collect();
    let (idx, caps) = lines
        .iter()
        .enumerate()
        .find_map(|(idx, line)| GO_PANIC.captures(line).map(|caps| (idx, caps)))?;
    let frames = lines
        .iter()
        .skip(idx + 1)
        .filter_map(|line| GO_FRAME.captures(line))
        .filter_map(|frame| capture_line(&frame).map(|n| (frame["file"].to_string(), n)))
        .collect();
    Some(RawFailure {
        class: "go panic".to_string(),
        message: caps["msg"].to_string(),
        frames,
    })
}

fn parse_compiler(text: &str) -> Option<RawFailure> {
    text.lines().find_map(|line| {
        let line = line.trim_end();
        if let Some(caps) = TSC_ERROR.captures(line) {
            return Some(RawFailure {
                class: caps["code"].to_string(),
                message: caps["msg"].to_string(),
                frames: capture_line(&caps)
                    .map(|n| vec![(caps["file"].to_string(), n)])
                    .unwrap_or_default(),
            });
        }
        let caps = COMPILER_ERROR.captures(line)?;
        Some(RawFailure {
            class: "compile error".to_string(),
            message: caps["msg"].to_string(),
            frames: capture_line(&caps)
                .map(|n| vec![(caps["file"].to_string(), n)])
                .unwrap_or_default(),
        })
    })
}

fn parse_generic(text: &str) -> Option<RawFailure> {
    let (class, message) = text.lines().find_map(|line| {
        GENERIC_CLASS
            .captures(line)
            .map(|caps| (caps["class"].to_string(), caps["msg"].trim().to_string()))
    })?;
    let frames = text
        .lines()
        .flat_map(|line| GENERIC_LOCATION.captures_iter(line))
        .filter_map(|caps| capture_line(&caps).map(|n| (caps["file"].to_string(), n)))
        .take(8)
        .collect();
    Some(RawFailure {
        class,
        message,
        frames,
    })
}
