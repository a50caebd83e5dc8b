//! FixLoop - run, capture, patch, guard, apply, verify, remember
//!
//! The loop is an explicit state machine. [`FixLoop::step`] maps one
//! [`LoopState`] to the next and [`FixLoop::run`] drives it to `Success` or
//! `Aborted`, recording every state it passes through.
//!
//! Guarantees held on every path:
//! - nothing is written without an [`ApprovedPatch`]
//! - at most one patch is applied at a time, and it is reverted unless it
//!   passed verification
//! - fix memory is only written after a passing verification
//! - the workspace lock is held for the whole loop and released on return

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{ApplyError, FixLoopError, GenerationError, RunContext, StoreError};
use crate::domain::models::{
    ApprovalDecision, ApprovedPatch, Config, ErrorSignature, MemoryEntry, Patch, PatchOrigin,
    PolicyViolation, RecordMeta, Run, VerificationResult,
};
use crate::domain::ports::{
    ApprovalAnswer, ApprovalGate, ApprovalPrompt, CommandRunner, CommandSpec, FileContext,
    FixMemory, PatchGenerator, PatchRequest, PatchResponse, PriorAttempt,
};
use crate::services::{
    GuardConfigError, GuardPolicy, PatchApplier, SignatureExtractor, Verifier, WorkspaceLock,
};

/// Lines of a stored diff passed to the generator as a hint.
const HINT_EXCERPT_LINES: usize = 40;

/// Settings for one fix loop invocation.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Project root; every patch must stay inside it
    pub root: PathBuf,
    /// The failing command
    pub command: String,
    /// Command re-run after a patch, the failing command when `None`
    pub verify_command: Option<String>,
    /// Patch attempts allowed for this run
    pub max_attempts: u32,
    pub command_timeout: Duration,
    pub verify_timeout: Duration,
    /// Unbounded when `None`
    pub approval_timeout: Option<Duration>,
    /// Apply guard-approved patches without asking
    pub auto_apply: bool,
    /// Directory holding per-project lock files
    pub lock_dir: PathBuf,
    pub lock_timeout: Duration,
    pub max_changed_lines: usize,
    pub sensitive_paths: Vec<String>,
    /// Fall back to similar memory entries
    pub similarity: bool,
    pub hint_limit: usize,
    /// Total bytes of file contents sent to the generator
    pub max_context_bytes: usize,
}

impl LoopConfig {
    /// Loop settings from loaded configuration.
    ///
    /// `max_attempts` is passed separately because it has no default.
    pub fn from_config(
        config: &Config,
        root: impl Into<PathBuf>,
        command: impl Into<String>,
        max_attempts: u32,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        let settings = &config.fix_loop;
        Self {
            root: root.into(),
            command: command.into(),
            verify_command: None,
            max_attempts,
            command_timeout: Duration::from_secs(settings.command_timeout_secs),
            verify_timeout: Duration::from_secs(
                settings
                    .verify_timeout_secs
                    .unwrap_or(settings.command_timeout_secs),
            ),
            approval_timeout: settings.approval_timeout_secs.map(Duration::from_secs),
            auto_apply: settings.auto_apply,
            lock_dir: lock_dir.into(),
            lock_timeout: Duration::from_secs(settings.lock_timeout_secs),
            max_changed_lines: config.guard.max_changed_lines,
            sensitive_paths: config.guard.sensitive_paths.clone(),
            similarity: config.memory.similarity,
            hint_limit: config.memory.hint_limit,
            max_context_bytes: settings.max_context_bytes,
        }
    }
}

/// One state of the loop. Data needed by the next step travels with it.
#[derive(Debug)]
pub enum LoopState {
    /// Take the workspace lock
    Plan,
    /// Run the command
    Running,
    /// The command failed; extract its signature
    ErrorCaptured { run: Run },
    /// Find a candidate patch in memory or from the generator
    MemoryLookup,
    /// A candidate exists and counts as an attempt
    PatchPending { patch: Patch },
    GuardCheck { patch: Patch },
    AwaitingApproval {
        patch: Patch,
        violation: Option<PolicyViolation>,
    },
    Applying { approved: ApprovedPatch },
    Verifying { patch: Patch },
    /// The same error persisted; the patch was reverted
    Retry { result: VerificationResult },
    Success(LoopOutcome),
    Aborted(FixLoopError),
}

impl LoopState {
    pub const fn kind(&self) -> StateKind {
        match self {
            Self::Plan => StateKind::Plan,
            Self::Running => StateKind::Running,
            Self::ErrorCaptured { .. } => StateKind::ErrorCaptured,
            Self::MemoryLookup => StateKind::MemoryLookup,
            Self::PatchPending { .. } => StateKind::PatchPending,
            Self::GuardCheck { .. } => StateKind::GuardCheck,
            Self::AwaitingApproval { .. } => StateKind::AwaitingApproval,
            Self::Applying { .. } => StateKind::Applying,
            Self::Verifying { .. } => StateKind::Verifying,
            Self::Retry { .. } => StateKind::Retry,
            Self::Success(_) => StateKind::Success,
            Self::Aborted(_) => StateKind::Aborted,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Aborted(_))
    }
}

/// Data-free tag of a [`LoopState`], used for the transition trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Plan,
    Running,
    ErrorCaptured,
    MemoryLookup,
    PatchPending,
    GuardCheck,
    AwaitingApproval,
    Applying,
    Verifying,
    Retry,
    Success,
    Aborted,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Plan => "plan",
            Self::Running => "running",
            Self::ErrorCaptured => "error_captured",
            Self::MemoryLookup => "memory_lookup",
            Self::PatchPending => "patch_pending",
            Self::GuardCheck => "guard_check",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Applying => "applying",
            Self::Verifying => "verifying",
            Self::Retry => "retry",
            Self::Success => "success",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How a loop ended.
#[derive(Debug)]
pub enum LoopOutcome {
    /// The command succeeded on the first run
    NoError,
    /// A patch passed verification and was recorded
    Resolved {
        entry: MemoryEntry,
        origin: PatchOrigin,
        attempts: u32,
    },
    Aborted(FixLoopError),
}

/// Everything a caller needs to report on a finished loop.
#[derive(Debug)]
pub struct LoopReport {
    pub loop_id: Uuid,
    pub command: String,
    pub outcome: LoopOutcome,
    /// Every state entered, in order, starting with `Plan`
    pub transitions: Vec<StateKind>,
    pub attempts: u32,
    pub original_run: Option<Run>,
    pub signature: Option<ErrorSignature>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl LoopReport {
    /// Process exit code: 0 when resolved or nothing failed.
    pub const fn exit_code(&self) -> i32 {
        match &self.outcome {
            LoopOutcome::NoError | LoopOutcome::Resolved { .. } => 0,
            LoopOutcome::Aborted(err) => err.exit_code(),
        }
    }

    pub const fn error(&self) -> Option<&FixLoopError> {
        match &self.outcome {
            LoopOutcome::Aborted(err) => Some(err),
            _ => None,
        }
    }
}

/// Mutable bookkeeping for one loop.
#[derive(Default)]
struct Session {
    lock: Option<WorkspaceLock>,
    original: Option<(Run, ErrorSignature)>,
    attempts: u32,
    /// Memory entries already replayed in this loop
    excluded_fingerprints: Vec<String>,
    /// Digests of every candidate patch so far
    tried_digests: HashSet<String>,
    prior_attempts: Vec<PriorAttempt>,
}

impl Session {
    fn context(&self) -> Option<RunContext> {
        self.original
            .as_ref()
            .map(|(run, signature)| RunContext::new(run, Some(signature)))
    }
}

/// Drives one fix loop for one project.
pub struct FixLoop {
    config: LoopConfig,
    runner: Arc<dyn CommandRunner>,
    memory: Arc<dyn FixMemory>,
    generator: Arc<dyn PatchGenerator>,
    approval: Arc<dyn ApprovalGate>,
    extractor: SignatureExtractor,
    guard: GuardPolicy,
    verifier: Verifier,
    applier: PatchApplier,
    session: Session,
}

impl FixLoop {
    /// Wire a loop from its collaborators.
    ///
    /// # Errors
    /// Returns an error if the root does not exist or a sensitive-path
    /// pattern is invalid
    pub fn new(
        config: LoopConfig,
        runner: Arc<dyn CommandRunner>,
        memory: Arc<dyn FixMemory>,
        generator: Arc<dyn PatchGenerator>,
        approval: Arc<dyn ApprovalGate>,
    ) -> Result<Self, GuardConfigError> {
        let guard = GuardPolicy::new(
            &config.root,
            config.max_changed_lines,
            &config.sensitive_paths,
        )?;
        let extractor = SignatureExtractor::new(&config.root);
        let verifier = Verifier::new(
            Arc::clone(&runner),
            extractor.clone(),
            config
                .verify_command
                .clone()
                .unwrap_or_else(|| config.command.clone()),
            &config.root,
            config.verify_timeout,
        );
        let applier = PatchApplier::new(&config.root);

        Ok(Self {
            config,
            runner,
            memory,
            generator,
            approval,
            extractor,
            guard,
            verifier,
            applier,
            session: Session::default(),
        })
    }

    /// Run the loop to completion.
    #[instrument(skip_all, fields(loop_id = tracing::field::Empty, command = %self.config.command))]
    pub async fn run(mut self) -> LoopReport {
        let loop_id = Uuid::new_v4();
        tracing::Span::current().record("loop_id", tracing::field::display(loop_id));
        let started_at = Utc::now();
        info!(root = %self.config.root.display(), max_attempts = self.config.max_attempts, "fix loop started");

        let mut state = LoopState::Plan;
        let mut transitions = vec![state.kind()];
        let outcome = loop {
            match state {
                LoopState::Success(outcome) => break outcome,
                LoopState::Aborted(err) => {
                    warn!(error = %err, exit_code = err.exit_code(), "fix loop aborted");
                    break LoopOutcome::Aborted(err);
                }
                current => {
                    let from = current.kind();
                    state = self.step(current).await;
                    debug!(from = %from, to = %state.kind(), "transition");
                    transitions.push(state.kind());
                }
            }
        };

        // Nothing unverified may stay in the tree
        if self.applier.has_pending() {
            if let Err(err) = self.applier.revert() {
                warn!(error = %err, "revert after abort failed");
            }
        }
        drop(self.session.lock.take());

        let (original_run, signature) = self.session.original.take().unzip();

        LoopReport {
            loop_id,
            command: self.config.command.clone(),
            outcome,
            transitions,
            attempts: self.session.attempts,
            original_run,
            signature,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Advance one state.
    pub async fn step(&mut self, state: LoopState) -> LoopState {
        match state {
            LoopState::Plan => self.plan().await,
            LoopState::Running => self.execute().await,
            LoopState::ErrorCaptured { run } => self.capture(run),
            LoopState::MemoryLookup => self.lookup().await,
            LoopState::PatchPending { patch } => self.pending(patch),
            LoopState::GuardCheck { patch } => self.guard_check(patch),
            LoopState::AwaitingApproval { patch, violation } => {
                self.await_approval(patch, violation).await
            }
            LoopState::Applying { approved } => self.apply(approved),
            LoopState::Verifying { patch } => self.verify(patch).await,
            LoopState::Retry { result } => {
                info!(result = %result, attempts = self.session.attempts, "retrying");
                LoopState::MemoryLookup
            }
            terminal @ (LoopState::Success(_) | LoopState::Aborted(_)) => terminal,
        }
    }

    async fn plan(&mut self) -> LoopState {
        match WorkspaceLock::acquire(
            &self.config.lock_dir,
            &self.config.root,
            self.config.lock_timeout,
        )
        .await
        {
            Ok(lock) => {
                self.session.lock = Some(lock);
                LoopState::Running
            }
            Err(err) => LoopState::Aborted(err.into()),
        }
    }

    async fn execute(&mut self) -> LoopState {
        let spec = CommandSpec::new(
            &self.config.command,
            &self.config.root,
            self.config.command_timeout,
        );
        let run = match self.runner.run(&spec).await {
            Ok(run) => run,
            Err(err) => return LoopState::Aborted(err.into()),
        };

        if run.is_timed_out() {
            return LoopState::Aborted(FixLoopError::ExecutionTimeout {
                timeout_secs: self.config.command_timeout.as_secs(),
                context: RunContext::new(&run, None),
            });
        }
        if run.succeeded() {
            info!("command succeeded, nothing to fix");
            return LoopState::Success(LoopOutcome::NoError);
        }
        info!(exit_code = ?run.exit_code(), "command failed");
        LoopState::ErrorCaptured { run }
    }

    fn capture(&mut self, run: Run) -> LoopState {
        let signature = self
            .extractor
            .extract_or_fallback(&run)
            .unwrap_or_else(|| ErrorSignature::unrecognized(run.exit_code(), &run.output_tail(1)));
        info!(
            signature = %signature,
            fingerprint = %signature.fingerprint(),
            recognized = signature.is_recognized(),
            "error captured"
        );
        self.session.original = Some((run, signature));
        LoopState::MemoryLookup
    }

    async fn lookup(&mut self) -> LoopState {
        // Nothing captured yet
        let Some((run, signature)) = self.session.original.clone() else {
            return LoopState::Running;
        };
        let context = RunContext::new(&run, Some(&signature));

        if self.session.attempts >= self.config.max_attempts {
            return LoopState::Aborted(FixLoopError::RetryBudgetExhausted {
                attempts: self.session.attempts,
                context,
            });
        }

        match self.find_in_memory(&signature).await {
            Ok(Some(patch)) => return LoopState::PatchPending { patch },
            Ok(None) => {}
            Err(err) => return LoopState::Aborted(err),
        }

        match self.generate(&run, &signature).await {
            Ok(patch) => LoopState::PatchPending { patch },
            Err(source) => LoopState::Aborted(FixLoopError::PatchGeneration { source, context }),
        }
    }

    /// Exact match first, then similarity, skipping anything already tried.
    async fn find_in_memory(
        &mut self,
        signature: &ErrorSignature,
    ) -> Result<Option<Patch>, FixLoopError> {
        let fingerprint = signature.fingerprint();
        // Every pass excludes one more entry, so this ends once memory runs dry
        loop {
            let Some(entry) = self.next_memory_candidate(signature).await? else {
                break;
            };
            self.session.excluded_fingerprints.push(entry.fingerprint.clone());

            let origin = PatchOrigin::ReplayedFromMemory {
                fingerprint: entry.fingerprint.clone(),
            };
            match Patch::parse(&entry.patch, origin) {
                Ok(patch) if self.session.tried_digests.contains(patch.digest()) => {
                    debug!(entry = %entry.fingerprint, "stored patch already tried");
                }
                Ok(patch) => {
                    info!(
                        entry = %entry.fingerprint,
                        exact = entry.fingerprint == fingerprint,
                        success_count = entry.success_count,
                        "replaying fix from memory"
                    );
                    return Ok(Some(patch));
                }
                Err(err) => {
                    warn!(entry = %entry.fingerprint, error = %err, "stored patch does not parse, ignoring");
                }
            }
        }

        debug!(fingerprint = %fingerprint, "memory miss");
        Ok(None)
    }

    async fn next_memory_candidate(
        &self,
        signature: &ErrorSignature,
    ) -> Result<Option<MemoryEntry>, StoreError> {
        let fingerprint = signature.fingerprint();
        let excluded = &self.session.excluded_fingerprints;
        if !excluded.iter().any(|f| f == fingerprint) {
            if let Some(entry) = self.memory.lookup(fingerprint).await? {
                return Ok(Some(entry));
            }
        }
        if !self.config.similarity {
            return Ok(None);
        }
        self.memory.lookup_similar(signature, excluded).await
    }

    async fn generate(
        &self,
        run: &Run,
        signature: &ErrorSignature,
    ) -> Result<Patch, GenerationError> {
        let request = PatchRequest {
            command: run.command().to_string(),
            exit_code: run.exit_code(),
            stdout: run.stdout().to_string(),
            stderr: run.stderr().to_string(),
            signature: signature.clone(),
            files: self.file_context(signature).await,
            prior_attempts: self.session.prior_attempts.clone(),
            memory_hints: self.memory_hints(signature).await,
        };

        match self.generator.generate(&request).await? {
            PatchResponse::NoPatch { reason } => Err(GenerationError::NoPatch { reason }),
            PatchResponse::Diff(text) => {
                let patch = Patch::parse(&text, PatchOrigin::Generated)
                    .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;
                if self.session.tried_digests.contains(patch.digest()) {
                    return Err(GenerationError::RepeatedPatch);
                }
                info!(digest = %patch.digest(), changed_lines = patch.changed_lines(), "patch generated");
                Ok(patch)
            }
        }
    }

    /// Files the failure points at, inside the root, within the byte budget.
    async fn file_context(&self, signature: &ErrorSignature) -> Vec<FileContext> {
        let Ok(root) = self.config.root.canonicalize() else {
            return Vec::new();
        };
        let mut budget = self.config.max_context_bytes;
        let mut files = Vec::new();

        for rel in signature.related_files() {
            if budget == 0 {
                break;
            }
            let Some(contents) = read_inside(&root, rel).await else {
                continue;
            };
            let truncated = contents.len() > budget;
            let contents = if truncated {
                truncate_at_char_boundary(&contents, budget).to_string()
            } else {
                contents
            };
            budget -= contents.len();
            files.push(FileContext {
                path: rel.clone(),
                contents,
                truncated,
            });
        }
        files
    }

    async fn memory_hints(&self, signature: &ErrorSignature) -> Vec<String> {
        if self.config.hint_limit == 0 {
            return Vec::new();
        }
        match self.memory.hints(signature, self.config.hint_limit).await {
            Ok(entries) => entries
                .iter()
                .map(|entry| {
                    let excerpt: Vec<&str> =
                        entry.patch.lines().take(HINT_EXCERPT_LINES).collect();
                    format!(
                        "{} ({} successful uses):\n{}",
                        entry.error_class,
                        entry.success_count,
                        excerpt.join("\n")
                    )
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "could not load memory hints");
                Vec::new()
            }
        }
    }

    fn pending(&mut self, patch: Patch) -> LoopState {
        self.session.attempts += 1;
        self.session.tried_digests.insert(patch.digest().to_string());
        info!(
            attempt = self.session.attempts,
            origin = %patch.origin(),
            digest = %patch.digest(),
            files = patch.files().len(),
            "candidate patch"
        );
        LoopState::GuardCheck { patch }
    }

    fn guard_check(&self, patch: Patch) -> LoopState {
        match self.guard.evaluate(&patch) {
            ApprovalDecision::BlockedByPolicy { violation } => {
                warn!(violation = %violation, "patch blocked by policy");
                LoopState::AwaitingApproval {
                    patch,
                    violation: Some(violation),
                }
            }
            decision if !self.config.auto_apply => {
                debug!(decision = %decision, "auto-apply disabled, asking");
                LoopState::AwaitingApproval {
                    patch,
                    violation: None,
                }
            }
            decision => match ApprovedPatch::new(patch, decision) {
                Ok(approved) => LoopState::Applying { approved },
                Err((patch, _)) => LoopState::AwaitingApproval {
                    patch,
                    violation: None,
                },
            },
        }
    }

    async fn await_approval(
        &self,
        patch: Patch,
        violation: Option<PolicyViolation>,
    ) -> LoopState {
        let prompt = violation
            .as_ref()
            .map_or(ApprovalPrompt::Confirm, ApprovalPrompt::Blocked);
        let request = self.approval.request(&patch, prompt);
        let answer = match self.config.approval_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .unwrap_or_else(|_| {
                    warn!(timeout_secs = limit.as_secs(), "approval timed out");
                    ApprovalAnswer::Cancelled
                }),
            None => request.await,
        };
        info!(answer = ?answer, "approval answered");

        let decision = if answer == ApprovalAnswer::Approve {
            ApprovalDecision::ApprovedByUser
        } else {
            ApprovalDecision::Rejected
        };
        match ApprovedPatch::new(patch, decision) {
            Ok(approved) => LoopState::Applying { approved },
            Err(_) => LoopState::Aborted(FixLoopError::Rejected {
                violation,
                context: self.session.context().unwrap_or_else(empty_context),
            }),
        }
    }

    fn apply(&mut self, approved: ApprovedPatch) -> LoopState {
        match self.applier.apply(&approved) {
            Ok(()) => LoopState::Verifying {
                patch: approved.into_patch(),
            },
            Err(source @ (ApplyError::Conflict { .. } | ApplyError::MissingTarget { .. })) => {
                LoopState::Aborted(FixLoopError::ApplyConflict {
                    source,
                    context: self.session.context().unwrap_or_else(empty_context),
                })
            }
            Err(err) => LoopState::Aborted(err.into()),
        }
    }

    async fn verify(&mut self, patch: Patch) -> LoopState {
        let Some((run, signature)) = self.session.original.clone() else {
            return LoopState::Running;
        };
        let (result, after) = match self.verifier.verify(&signature).await {
            Ok(outcome) => outcome,
            Err(err) => return LoopState::Aborted(err.into()),
        };

        if result.is_pass() {
            let origin = patch.origin().clone();
            // Recorded before committing so a store failure can still revert
            let entry = match self
                .memory
                .record(&signature, &patch, RecordMeta::passed_now())
                .await
            {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "failed to record verified fix, reverting");
                    if let Err(revert) = self.applier.revert() {
                        return LoopState::Aborted(revert.into());
                    }
                    return LoopState::Aborted(err.into());
                }
            };
            if let Err(err) = self.applier.commit() {
                return LoopState::Aborted(err.into());
            }
            info!(
                fingerprint = %entry.fingerprint,
                success_count = entry.success_count,
                attempts = self.session.attempts,
                "fix verified and recorded"
            );
            return LoopState::Success(LoopOutcome::Resolved {
                entry,
                origin,
                attempts: self.session.attempts,
            });
        }

        if let Err(err) = self.applier.revert() {
            return LoopState::Aborted(err.into());
        }

        if result == VerificationResult::FailSameError {
            self.session.prior_attempts.push(PriorAttempt {
                diff: patch.raw().to_string(),
                result: result.clone(),
            });
            return LoopState::Retry { result };
        }

        LoopState::Aborted(FixLoopError::VerificationRegression {
            result,
            original: RunContext::new(&run, Some(&signature)),
            after: RunContext::new(&after, None),
        })
    }
}

fn empty_context() -> RunContext {
    RunContext {
        command: String::new(),
        exit_code: None,
        timed_out: false,
        signature: None,
        output_tail: String::new(),
    }
}

/// Read `rel` if it resolves to a UTF-8 file inside `root`.
async fn read_inside(root: &Path, rel: &str) -> Option<String> {
    let resolved = tokio::fs::canonicalize(root.join(rel)).await.ok()?;
    if !resolved.starts_with(root) {
        return None;
    }
    let bytes = tokio::fs::read(&resolved).await.ok()?;
    String::from_utf8(bytes).ok()
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    let mut end = max.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
