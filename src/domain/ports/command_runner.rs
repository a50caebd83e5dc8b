use crate::domain::errors::ExecError;
use crate::domain::models::Run;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// A shell command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            timeout,
        }
    }
}

/// Runs commands and captures their output.
///
/// A command that exceeds its timeout is killed and reported as a timed-out
/// [`Run`], not as an error. Errors are reserved for failing to start or
/// observe the process at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<Run, ExecError>;
}
