//! Common test utilities for integration tests
//!
//! Fakes for every port the fix loop talks to, plus a small project tree
//! whose "test command" fails while `calc.py` divides by zero.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use fixloop::adapters::sqlite::{create_migrated_test_pool, SqliteFixMemory};
use fixloop::application::{FixLoop, LoopConfig};
use fixloop::domain::errors::{ExecError, GenerationError};
use fixloop::domain::models::{Patch, Run};
use fixloop::domain::ports::{
    ApprovalAnswer, ApprovalGate, ApprovalPrompt, CommandRunner, CommandSpec, PatchGenerator,
    PatchRequest, PatchResponse,
};

pub const BUGGY_CALC: &str = "def divide():\n    return 1 / 0\n";

/// Diff that fixes [`BUGGY_CALC`].
pub const FIX_DIFF: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def divide():
-    return 1 / 0
+    return 1 / 1
";

/// Diff that swaps the division error for a `NameError`.
pub const NEW_ERROR_DIFF: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def divide():
-    return 1 / 0
+    return undefined_name / 0
";

/// Diff that applies cleanly but changes nothing that matters.
pub fn noop_diff(n: usize) -> String {
    format!(
        "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n-def divide():\n+def divide():  # attempt {n}\n     return 1 / 0\n"
    )
}

pub fn zero_division_traceback() -> String {
    "Traceback (most recent call last):\n  File \"calc.py\", line 2, in divide\n    return 1 / 0\nZeroDivisionError: division by zero\n".to_string()
}

pub fn name_error_traceback() -> String {
    "Traceback (most recent call last):\n  File \"calc.py\", line 2, in divide\n    return undefined_name / 0\nNameError: name 'undefined_name' is not defined\n".to_string()
}

/// A project with a failing `calc.py` and an unrelated file.
pub fn project() -> TempDir {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    fs::write(dir.path().join("calc.py"), BUGGY_CALC).expect("write calc.py");
    fs::write(dir.path().join("README.md"), "# demo\n").expect("write README.md");
    dir
}

/// Every file under `root` with its bytes, for before/after comparisons.
pub fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<(PathBuf, Vec<u8>)> = fs::read_dir(root)
        .expect("read project")
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .map(|e| {
            let path = e.path();
            let bytes = fs::read(&path).expect("read file");
            (path, bytes)
        })
        .collect();
    files.sort();
    files
}

/// What the fake command does on one invocation.
pub enum Outcome {
    Exit(i32, String),
    TimedOut,
}

type Script = dyn Fn(&Path) -> Outcome + Send + Sync;

/// Command runner driven by a closure over the project tree.
pub struct FakeRunner {
    script: Box<Script>,
    calls: AtomicUsize,
}

impl FakeRunner {
    pub fn new(script: impl Fn(&Path) -> Outcome + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    /// Behaves like `python calc.py` against the current contents of `calc.py`.
    pub fn python() -> Self {
        Self::new(|cwd| {
            let source = fs::read_to_string(cwd.join("calc.py")).unwrap_or_default();
            if source.contains("undefined_name") {
                Outcome::Exit(1, name_error_traceback())
            } else if source.contains("1 / 0") {
                Outcome::Exit(1, zero_division_traceback())
            } else {
                Outcome::Exit(0, String::new())
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<Run, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Utc::now();
        Ok(match (self.script)(&spec.cwd) {
            Outcome::Exit(code, stderr) => Run::completed(
                &spec.command,
                &spec.cwd,
                Some(code),
                "",
                stderr,
                started,
                Duration::from_millis(5),
            ),
            Outcome::TimedOut => Run::timed_out(
                &spec.command,
                &spec.cwd,
                "",
                "still running",
                started,
                spec.timeout,
            ),
        })
    }
}

/// Patch generator answering from a queue and recording every request.
#[derive(Default)]
pub struct ScriptedGenerator {
    answers: Mutex<VecDeque<Result<PatchResponse, GenerationError>>>,
    requests: Mutex<Vec<PatchRequest>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(answers: Vec<Result<PatchResponse, GenerationError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            ..Self::default()
        }
    }

    pub fn diffs<S: Into<String>>(diffs: impl IntoIterator<Item = S>) -> Self {
        Self::new(
            diffs
                .into_iter()
                .map(|d| Ok(PatchResponse::Diff(d.into())))
                .collect(),
        )
    }

    /// A generator that must never be asked.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<PatchRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl PatchGenerator for ScriptedGenerator {
    async fn generate(&self, request: &PatchRequest) -> Result<PatchResponse, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.answers
            .lock()
            .expect("answers lock")
            .pop_front()
            .unwrap_or(Ok(PatchResponse::NoPatch {
                reason: Some("script exhausted".to_string()),
            }))
    }
}

/// Approval gate with a fixed answer.
pub struct ScriptedApproval {
    answer: ApprovalAnswer,
    delay: Option<Duration>,
    prompts: Mutex<Vec<(String, bool)>>,
}

impl ScriptedApproval {
    pub fn answering(answer: ApprovalAnswer) -> Self {
        Self {
            answer,
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Never answers within `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            answer: ApprovalAnswer::Approve,
            delay: Some(delay),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// `(patch digest, was blocked by policy)` for every prompt shown.
    pub fn prompts(&self) -> Vec<(String, bool)> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl ApprovalGate for ScriptedApproval {
    async fn request(&self, patch: &Patch, prompt: ApprovalPrompt<'_>) -> ApprovalAnswer {
        let blocked = matches!(prompt, ApprovalPrompt::Blocked(_));
        self.prompts
            .lock()
            .expect("prompts lock")
            .push((patch.digest().to_string(), blocked));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer
    }
}

pub async fn memory() -> Arc<SqliteFixMemory> {
    let pool = create_migrated_test_pool()
        .await
        .expect("Failed to create test pool");
    Arc::new(SqliteFixMemory::new(pool))
}

/// Loop settings for `root` with locks kept under `lock_dir`.
pub fn loop_config(root: &Path, lock_dir: &Path, max_attempts: u32) -> LoopConfig {
    LoopConfig {
        root: root.to_path_buf(),
        command: "python calc.py".to_string(),
        verify_command: None,
        max_attempts,
        command_timeout: Duration::from_secs(30),
        verify_timeout: Duration::from_secs(30),
        approval_timeout: None,
        auto_apply: true,
        lock_dir: lock_dir.to_path_buf(),
        lock_timeout: Duration::from_secs(1),
        max_changed_lines: 60,
        sensitive_paths: fixloop::domain::models::config::default_sensitive_paths(),
        similarity: true,
        hint_limit: 3,
        max_context_bytes: 64 * 1024,
    }
}

/// Everything a scenario needs, wired together.
pub struct Harness {
    pub project: TempDir,
    pub locks: TempDir,
    pub runner: Arc<FakeRunner>,
    pub memory: Arc<SqliteFixMemory>,
}

impl Harness {
    pub async fn new() -> Self {
        Self {
            project: project(),
            locks: tempfile::tempdir().expect("Failed to create lock dir"),
            runner: Arc::new(FakeRunner::python()),
            memory: memory().await,
        }
    }

    pub fn root(&self) -> &Path {
        self.project.path()
    }

    pub fn config(&self, max_attempts: u32) -> LoopConfig {
        loop_config(self.project.path(), self.locks.path(), max_attempts)
    }

    pub fn fix_loop(
        &self,
        config: LoopConfig,
        generator: Arc<ScriptedGenerator>,
        approval: Arc<ScriptedApproval>,
    ) -> FixLoop {
        FixLoop::new(
            config,
            Arc::clone(&self.runner) as Arc<dyn CommandRunner>,
            Arc::clone(&self.memory) as Arc<dyn fixloop::domain::ports::FixMemory>,
            generator,
            approval,
        )
        .expect("valid loop config")
    }

    pub fn calc(&self) -> String {
        fs::read_to_string(self.root().join("calc.py")).expect("read calc.py")
    }

    pub fn reintroduce_bug(&self) {
        fs::write(self.root().join("calc.py"), BUGGY_CALC).expect("write calc.py");
    }
}
