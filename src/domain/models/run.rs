//! Captured command executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One execution of a shell command and everything it produced.
///
/// A `Run` is immutable once captured. It is built by the command runner and
/// only read afterwards, so every field is exposed through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    command: String,
    cwd: PathBuf,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    started_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    duration: Duration,
    timed_out: bool,
}

impl Run {
    /// Build a run that finished on its own.
    pub fn completed(
        command: impl Into<String>,
        cwd: impl Into<PathBuf>,
        exit_code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            started_at,
            duration,
            timed_out: false,
        }
    }

    /// Build a run that was killed after exceeding its time limit.
    ///
    /// Whatever output was read before the kill is kept.
    pub fn timed_out(
        command: impl Into<String>,
        cwd: impl Into<PathBuf>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            exit_code: None,
            stdout: stdout.into(),
            stderr: stderr.into(),
            started_at,
            duration,
            timed_out: true,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Exit code, `None` when the process was killed by a signal or timed out.
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub const fn duration(&self) -> Duration {
        self.duration
    }

    pub const fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// True when the command exited with status 0.
    pub const fn succeeded(&self) -> bool {
        matches!(self.exit_code, Some(0)) && !self.timed_out
    }

    /// The last `max_lines` lines of stderr, or of stdout when stderr is empty.
    pub fn output_tail(&self, max_lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(exit_code: Option<i32>, stdout: &str, stderr: &str) -> Run {
        Run::completed(
            "make test",
            "/tmp/project",
            exit_code,
            stdout,
            stderr,
            Utc::now(),
            Duration::from_millis(40),
        )
    }

    #[test]
    fn test_succeeded_only_for_zero_exit() {
        assert!(run_with(Some(0), "", "").succeeded());
        assert!(!run_with(Some(1), "", "").succeeded());
        assert!(!run_with(None, "", "").succeeded());
    }

    #[test]
    fn test_timed_out_run_never_succeeds() {
        let run = Run::timed_out("sleep 10", "/tmp", "", "", Utc::now(), Duration::from_secs(1));
        assert!(run.is_timed_out());
        assert!(!run.succeeded());
        assert_eq!(run.exit_code(), None);
    }

    #[test]
    fn test_output_tail_prefers_stderr() {
        let run = run_with(Some(1), "out", "a\nb\nc\nd");
        assert_eq!(run.output_tail(2), "c\nd");

        let quiet = run_with(Some(1), "x\ny", "  \n");
        assert_eq!(quiet.output_tail(5), "x\ny");
    }
}
