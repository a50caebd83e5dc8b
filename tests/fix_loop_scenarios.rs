//! End-to-end fix loop scenarios against fake collaborators and a real
//! in-memory fix memory.

mod common;

use std::fmt::Write as _;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::{
    noop_diff, snapshot, FakeRunner, Harness, Outcome, ScriptedApproval, ScriptedGenerator,
    FIX_DIFF, NEW_ERROR_DIFF,
};
use async_trait::async_trait;
use fixloop::adapters::sqlite::SqliteFixMemory;
use fixloop::application::{FixLoop, LoopOutcome, StateKind};
use fixloop::domain::errors::{FixLoopError, GenerationError, StoreError};
use fixloop::domain::models::{
    ErrorSignature, Frame, MemoryEntry, Patch, PatchOrigin, PolicyViolation, RecordMeta,
    VerificationResult,
};
use fixloop::domain::ports::{ApprovalAnswer, CommandRunner, FixMemory, PatchResponse};
use fixloop::services::WorkspaceLock;

fn approve() -> Arc<ScriptedApproval> {
    Arc::new(ScriptedApproval::answering(ApprovalAnswer::Approve))
}

fn reject() -> Arc<ScriptedApproval> {
    Arc::new(ScriptedApproval::answering(ApprovalAnswer::Reject))
}

/// Store `diff` as a verified fix for the division error at `calc.py:line`.
async fn seed(h: &Harness, line: u32, diff: &str) -> String {
    let signature = ErrorSignature::new(
        "ZeroDivisionError",
        "division by zero",
        Some(Frame::new("calc.py", line)),
        vec!["calc.py".to_string()],
    );
    let patch = Patch::parse(diff, PatchOrigin::Generated).unwrap();
    h.memory
        .record(&signature, &patch, RecordMeta::passed_now())
        .await
        .unwrap()
        .fingerprint
}

/// Reads from the real store, refuses every write.
struct UnwritableMemory(Arc<SqliteFixMemory>);

#[async_trait]
impl FixMemory for UnwritableMemory {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<MemoryEntry>, StoreError> {
        self.0.lookup(fingerprint).await
    }

    async fn lookup_similar(
        &self,
        signature: &ErrorSignature,
        exclude: &[String],
    ) -> Result<Option<MemoryEntry>, StoreError> {
        self.0.lookup_similar(signature, exclude).await
    }

    async fn record(
        &self,
        _signature: &ErrorSignature,
        _patch: &Patch,
        _meta: RecordMeta,
    ) -> Result<MemoryEntry, StoreError> {
        Err(StoreError::QueryFailed(sqlx::Error::PoolClosed))
    }

    async fn hints(
        &self,
        signature: &ErrorSignature,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        self.0.hints(signature, limit).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        self.0.list(limit).await
    }
}

#[tokio::test]
async fn test_fresh_fix_is_recorded_with_count_one() {
    let h = Harness::new().await;
    let generator = Arc::new(ScriptedGenerator::diffs([FIX_DIFF]));

    let report = h
        .fix_loop(h.config(3), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 0);
    let LoopOutcome::Resolved {
        entry,
        origin,
        attempts,
    } = &report.outcome
    else {
        panic!("expected resolved, got {:?}", report.outcome);
    };
    assert_eq!(entry.success_count, 1);
    assert_eq!(*origin, PatchOrigin::Generated);
    assert_eq!(*attempts, 1);
    assert_eq!(generator.calls(), 1);
    assert!(h.calc().contains("return 1 / 1"));
    assert_eq!(
        report.transitions,
        vec![
            StateKind::Plan,
            StateKind::Running,
            StateKind::ErrorCaptured,
            StateKind::MemoryLookup,
            StateKind::PatchPending,
            StateKind::GuardCheck,
            StateKind::Applying,
            StateKind::Verifying,
            StateKind::Success,
        ]
    );

    // The generator saw the failing file
    let request = &generator.requests()[0];
    assert_eq!(request.signature.class(), "ZeroDivisionError");
    assert!(request
        .files
        .iter()
        .any(|f| f.path == "calc.py" && f.contents.contains("1 / 0")));

    let stored = h
        .memory
        .lookup(report.signature.as_ref().unwrap().fingerprint())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.patch, FIX_DIFF);
}

#[tokio::test]
async fn test_replay_skips_generator_and_increments_count() {
    let h = Harness::new().await;
    let first = h
        .fix_loop(
            h.config(3),
            Arc::new(ScriptedGenerator::diffs([FIX_DIFF])),
            approve(),
        )
        .run()
        .await;
    assert_eq!(first.exit_code(), 0);

    h.reintroduce_bug();
    let silent = Arc::new(ScriptedGenerator::silent());
    let second = h
        .fix_loop(h.config(3), Arc::clone(&silent), approve())
        .run()
        .await;

    assert_eq!(second.exit_code(), 0);
    assert_eq!(silent.calls(), 0);
    let LoopOutcome::Resolved { entry, origin, .. } = &second.outcome else {
        panic!("expected resolved, got {:?}", second.outcome);
    };
    assert_eq!(entry.success_count, 2);
    assert!(matches!(origin, PatchOrigin::ReplayedFromMemory { .. }));
    assert!(h.calc().contains("return 1 / 1"));
    assert_eq!(h.memory.list(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_oversized_patch_rejected_leaves_tree_untouched() {
    let h = Harness::new().await;
    let mut big = String::new();
    for i in 0..250 {
        let _ = writeln!(big, "value_{i} = {i}");
    }
    fs::write(h.root().join("big.py"), &big).unwrap();

    let mut diff = String::from("--- a/big.py\n+++ b/big.py\n@@ -1,250 +1,250 @@\n");
    for i in 0..250 {
        let _ = writeln!(diff, "-value_{i} = {i}");
    }
    for i in 0..250 {
        let _ = writeln!(diff, "+value_{i} = {}", i + 1);
    }

    let before = snapshot(h.root());
    let approval = reject();
    let report = h
        .fix_loop(
            h.config(3),
            Arc::new(ScriptedGenerator::diffs([diff])),
            Arc::clone(&approval),
        )
        .run()
        .await;

    assert_eq!(report.exit_code(), 2);
    assert!(matches!(
        report.error(),
        Some(FixLoopError::Rejected {
            violation: Some(PolicyViolation::OversizedDiff {
                changed_lines: 500,
                ceiling: 60
            }),
            ..
        })
    ));
    assert_eq!(approval.prompts().len(), 1);
    assert!(approval.prompts()[0].1, "prompt should say the patch was blocked");
    assert_eq!(snapshot(h.root()), before);
    assert!(h.memory.list(10).await.unwrap().is_empty());
    assert!(!report.transitions.contains(&StateKind::Applying));
}

#[tokio::test]
async fn test_blocked_patch_approved_by_user_is_applied() {
    let h = Harness::new().await;
    let mut config = h.config(3);
    config.max_changed_lines = 1;
    let approval = approve();

    let report = h
        .fix_loop(
            config,
            Arc::new(ScriptedGenerator::diffs([FIX_DIFF])),
            Arc::clone(&approval),
        )
        .run()
        .await;

    assert_eq!(report.exit_code(), 0);
    assert!(report.transitions.contains(&StateKind::AwaitingApproval));
    assert_eq!(approval.prompts().len(), 1);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let h = Harness::new().await;
    let generator = Arc::new(ScriptedGenerator::diffs([
        noop_diff(1),
        noop_diff(2),
        noop_diff(3),
    ]));
    let before = snapshot(h.root());

    let report = h
        .fix_loop(h.config(2), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 3);
    assert!(matches!(
        report.error(),
        Some(FixLoopError::RetryBudgetExhausted { attempts: 2, .. })
    ));
    assert_eq!(report.attempts, 2);
    assert_eq!(generator.calls(), 2);
    assert_eq!(
        report
            .transitions
            .iter()
            .filter(|s| **s == StateKind::Retry)
            .count(),
        2
    );

    // The second request carried the failed first attempt
    let requests = generator.requests();
    assert_eq!(requests[1].prior_attempts.len(), 1);
    assert_eq!(
        requests[1].prior_attempts[0].result,
        VerificationResult::FailSameError
    );
    assert_eq!(snapshot(h.root()), before);
}

#[tokio::test]
async fn test_new_error_reverts_and_aborts() {
    let h = Harness::new().await;
    let before = snapshot(h.root());

    let report = h
        .fix_loop(
            h.config(3),
            Arc::new(ScriptedGenerator::diffs([NEW_ERROR_DIFF])),
            approve(),
        )
        .run()
        .await;

    assert_eq!(report.exit_code(), 4);
    let Some(FixLoopError::VerificationRegression { result, .. }) = report.error() else {
        panic!("expected regression, got {:?}", report.outcome);
    };
    assert!(matches!(
        result,
        VerificationResult::FailNewError { signature } if signature.class() == "NameError"
    ));
    assert_eq!(snapshot(h.root()), before);
    assert!(h.memory.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_passing_command_needs_no_fix() {
    let h = Harness::new().await;
    fs::write(h.root().join("calc.py"), "def divide():\n    return 1\n").unwrap();
    let generator = Arc::new(ScriptedGenerator::silent());

    let report = h
        .fix_loop(h.config(3), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 0);
    assert!(matches!(report.outcome, LoopOutcome::NoError));
    assert_eq!(
        report.transitions,
        vec![StateKind::Plan, StateKind::Running, StateKind::Success]
    );
    assert_eq!(generator.calls(), 0);
    assert_eq!(h.runner.calls(), 1);
}

#[tokio::test]
async fn test_conflicting_patch_aborts_without_writing() {
    let h = Harness::new().await;
    let stale = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def divide():\n-    return 2 / 0\n+    return 2 / 1\n";
    let before = snapshot(h.root());

    let report = h
        .fix_loop(
            h.config(3),
            Arc::new(ScriptedGenerator::diffs([stale])),
            approve(),
        )
        .run()
        .await;

    assert_eq!(report.exit_code(), 6);
    assert_eq!(snapshot(h.root()), before);
}

#[tokio::test]
async fn test_unreachable_generator() {
    let h = Harness::new().await;
    let generator = Arc::new(ScriptedGenerator::new(vec![Err(
        GenerationError::Unreachable("connection refused".to_string()),
    )]));

    let report = h
        .fix_loop(h.config(3), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 5);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_no_patch_answer_is_not_retried() {
    let h = Harness::new().await;
    let generator = Arc::new(ScriptedGenerator::new(vec![Ok(PatchResponse::NoPatch {
        reason: Some("needs a design change".to_string()),
    })]));

    let report = h
        .fix_loop(h.config(3), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 5);
    assert!(matches!(
        report.error(),
        Some(FixLoopError::PatchGeneration {
            source: GenerationError::NoPatch { .. },
            ..
        })
    ));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_repeated_patch_is_refused() {
    let h = Harness::new().await;
    let generator = Arc::new(ScriptedGenerator::diffs([noop_diff(1), noop_diff(1)]));

    let report = h
        .fix_loop(h.config(5), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 5);
    assert!(matches!(
        report.error(),
        Some(FixLoopError::PatchGeneration {
            source: GenerationError::RepeatedPatch,
            ..
        })
    ));
    assert_eq!(report.attempts, 1);
}

#[tokio::test]
async fn test_prose_answer_is_unusable_output() {
    let h = Harness::new().await;
    let before = snapshot(h.root());
    let generator = Arc::new(ScriptedGenerator::diffs([
        "Sure! Here is the fix: change line 2",
    ]));

    let report = h
        .fix_loop(h.config(3), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 5);
    assert!(matches!(
        report.error(),
        Some(FixLoopError::PatchGeneration {
            source: GenerationError::MalformedResponse(_),
            ..
        })
    ));
    assert_eq!(generator.calls(), 1);
    assert_eq!(snapshot(h.root()), before);
}

#[tokio::test]
async fn test_similar_entry_is_replayed_without_generator() {
    let h = Harness::new().await;
    let neighbour = seed(&h, 5, FIX_DIFF).await;
    let silent = Arc::new(ScriptedGenerator::silent());

    let report = h
        .fix_loop(h.config(3), Arc::clone(&silent), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(silent.calls(), 0);
    let LoopOutcome::Resolved { entry, origin, .. } = &report.outcome else {
        panic!("expected resolved, got {:?}", report.outcome);
    };
    assert_eq!(
        *origin,
        PatchOrigin::ReplayedFromMemory {
            fingerprint: neighbour.clone()
        }
    );
    // Recorded under the new fingerprint, the neighbour is left alone
    assert_ne!(entry.fingerprint, neighbour);
    assert_eq!(entry.success_count, 1);
    assert_eq!(h.memory.list(10).await.unwrap().len(), 2);
    assert!(h.calc().contains("return 1 / 1"));
}

#[tokio::test]
async fn test_failed_replay_falls_through_to_generator() {
    let h = Harness::new().await;
    let stale = noop_diff(1);
    seed(&h, 5, &stale).await;
    let generator = Arc::new(ScriptedGenerator::diffs([FIX_DIFF]));

    let report = h
        .fix_loop(h.config(3), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(generator.calls(), 1);
    let LoopOutcome::Resolved {
        origin, attempts, ..
    } = &report.outcome
    else {
        panic!("expected resolved, got {:?}", report.outcome);
    };
    assert_eq!(*origin, PatchOrigin::Generated);
    assert_eq!(*attempts, 2);

    let request = &generator.requests()[0];
    assert_eq!(request.prior_attempts.len(), 1);
    assert_eq!(request.prior_attempts[0].diff, stale);
    assert_eq!(
        request.prior_attempts[0].result,
        VerificationResult::FailSameError
    );
    assert_eq!(
        report.transitions,
        vec![
            StateKind::Plan,
            StateKind::Running,
            StateKind::ErrorCaptured,
            StateKind::MemoryLookup,
            StateKind::PatchPending,
            StateKind::GuardCheck,
            StateKind::Applying,
            StateKind::Verifying,
            StateKind::Retry,
            StateKind::MemoryLookup,
            StateKind::PatchPending,
            StateKind::GuardCheck,
            StateKind::Applying,
            StateKind::Verifying,
            StateKind::Success,
        ]
    );
}

#[tokio::test]
async fn test_already_tried_patch_skips_to_next_memory_entry() {
    let h = Harness::new().await;
    // Nearest two hold the same failing patch, the farthest holds the fix
    seed(&h, 3, &noop_diff(1)).await;
    seed(&h, 5, &noop_diff(1)).await;
    let good = seed(&h, 30, FIX_DIFF).await;
    let silent = Arc::new(ScriptedGenerator::silent());

    let report = h
        .fix_loop(h.config(3), Arc::clone(&silent), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(silent.calls(), 0);
    let LoopOutcome::Resolved {
        origin, attempts, ..
    } = &report.outcome
    else {
        panic!("expected resolved, got {:?}", report.outcome);
    };
    assert_eq!(*origin, PatchOrigin::ReplayedFromMemory { fingerprint: good });
    assert_eq!(*attempts, 2);
}

#[tokio::test]
async fn test_store_failure_reverts_verified_patch() {
    let h = Harness::new().await;
    let before = snapshot(h.root());
    let memory = Arc::new(UnwritableMemory(Arc::clone(&h.memory)));
    let fix_loop = FixLoop::new(
        h.config(3),
        Arc::clone(&h.runner) as Arc<dyn CommandRunner>,
        memory,
        Arc::new(ScriptedGenerator::diffs([FIX_DIFF])),
        approve(),
    )
    .unwrap();

    let report = fix_loop.run().await;

    assert_eq!(report.exit_code(), 1);
    assert!(matches!(report.error(), Some(FixLoopError::Store(_))));
    assert_eq!(snapshot(h.root()), before);
    assert!(h.memory.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_initial_timeout_aborts() {
    let mut h = Harness::new().await;
    h.runner = Arc::new(FakeRunner::new(|_| Outcome::TimedOut));
    let generator = Arc::new(ScriptedGenerator::silent());

    let report = h
        .fix_loop(h.config(3), Arc::clone(&generator), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 7);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn test_confirmation_mode_asks_before_applying() {
    let h = Harness::new().await;
    let mut config = h.config(3);
    config.auto_apply = false;
    let approval = reject();
    let before = snapshot(h.root());

    let report = h
        .fix_loop(
            config,
            Arc::new(ScriptedGenerator::diffs([FIX_DIFF])),
            Arc::clone(&approval),
        )
        .run()
        .await;

    assert_eq!(report.exit_code(), 2);
    assert!(matches!(
        report.error(),
        Some(FixLoopError::Rejected { violation: None, .. })
    ));
    assert!(!approval.prompts()[0].1);
    assert_eq!(snapshot(h.root()), before);
}

#[tokio::test]
async fn test_approval_timeout_counts_as_rejection() {
    let h = Harness::new().await;
    let mut config = h.config(3);
    config.auto_apply = false;
    config.approval_timeout = Some(Duration::from_millis(50));

    let report = h
        .fix_loop(
            config,
            Arc::new(ScriptedGenerator::diffs([FIX_DIFF])),
            Arc::new(ScriptedApproval::slow(Duration::from_secs(5))),
        )
        .run()
        .await;

    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn test_busy_workspace_aborts_before_running() {
    let h = Harness::new().await;
    let _held = WorkspaceLock::acquire(h.locks.path(), h.root(), Duration::ZERO)
        .await
        .unwrap();
    let mut config = h.config(3);
    config.lock_timeout = Duration::from_millis(100);

    let report = h
        .fix_loop(config, Arc::new(ScriptedGenerator::silent()), approve())
        .run()
        .await;

    assert_eq!(report.exit_code(), 1);
    assert!(matches!(report.error(), Some(FixLoopError::Workspace(_))));
    assert_eq!(h.runner.calls(), 0);
}
