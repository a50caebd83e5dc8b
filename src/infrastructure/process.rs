//! Shell command execution.
//!
//! Commands run through the platform shell with piped output. On timeout the
//! whole process group is killed so build tools that fork workers do not keep
//! running, and whatever output was read up to that point is kept.

use async_trait::async_trait;
use chrono::Utc;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::domain::errors::ExecError;
use crate::domain::models::Run;
use crate::domain::ports::{CommandRunner, CommandSpec};

/// Per-stream cap on captured output; the rest is drained and dropped.
const MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;

/// How long to keep draining pipes after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs commands through `sh -c` (or `cmd /C` on Windows).
#[derive(Debug, Clone, Default)]
pub struct ShellCommandRunner;

impl ShellCommandRunner {
    pub const fn new() -> Self {
        Self
    }

    fn build(command: &str) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<Run, ExecError> {
        tracing::debug!(command = %spec.command, cwd = %spec.cwd.display(), "running command");

        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = Self::build(&spec.command)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: spec.command.clone(),
                source,
            })?;

        let stdout = Capture::spawn(child.stdout.take());
        let stderr = Capture::spawn(child.stderr.take());

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(waited) => Some(waited.map_err(|source| ExecError::Wait {
                command: spec.command.clone(),
                source,
            })?),
            Err(_) => {
                tracing::warn!(
                    command = %spec.command,
                    timeout_secs = spec.timeout.as_secs(),
                    "command timed out, killing"
                );
                kill_tree(&mut child).await;
                None
            }
        };

        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;
        let duration = start.elapsed();

        let run = match status {
            Some(status) => Run::completed(
                &spec.command,
                &spec.cwd,
                status.code(),
                stdout,
                stderr,
                started_at,
                duration,
            ),
            None => Run::timed_out(&spec.command, &spec.cwd, stdout, stderr, started_at, duration),
        };

        tracing::debug!(
            command = %spec.command,
            exit_code = ?run.exit_code(),
            timed_out = run.is_timed_out(),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "command finished"
        );
        Ok(run)
    }
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            tracing::debug!(pid, error = %err, "killpg failed, falling back to kill");
        }
    }
    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "kill after timeout failed");
    }
}

/// Background reader that accumulates a pipe into a shared buffer.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                            let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
                            buf.extend_from_slice(&chunk[..n.min(room)]);
                        }
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finish(self) -> String {
        if let Some(task) = self.task {
            // Grandchildren can hold the pipe open after a kill
            if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                tracing::debug!("output pipe still open after grace period");
            }
        }
        let bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        text
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(command: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(command, std::env::temp_dir(), timeout)
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let runner = ShellCommandRunner::new();
        let run = runner
            .run(&spec("echo out; echo err >&2; exit 3", Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(run.exit_code(), Some(3));
        assert_eq!(run.stdout(), "out\n");
        assert_eq!(run.stderr(), "err\n");
        assert!(!run.is_timed_out());
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let runner = ShellCommandRunner::new();
        let run = runner
            .run(&CommandSpec::new("cat marker.txt", dir.path(), Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(run.succeeded());
        assert_eq!(run.stdout(), "here");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_keeps_partial_output() {
        let runner = ShellCommandRunner::new();
        let started = Instant::now();
        let run = runner
            .run(&spec("echo started; sleep 30", Duration::from_millis(300)))
            .await
            .unwrap();

        assert!(run.is_timed_out());
        assert_eq!(run.exit_code(), None);
        assert_eq!(run.stdout(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
