//! Re-runs the verification command after a patch and classifies the result
//! against the error that triggered the fix.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::ExecError;
use crate::domain::models::{ErrorSignature, Run, UnrelatedReason, VerificationResult};
use crate::domain::ports::{CommandRunner, CommandSpec};
use crate::services::signature_extractor::SignatureExtractor;

/// Runs one verification command with a fixed timeout.
pub struct Verifier {
    runner: Arc<dyn CommandRunner>,
    extractor: SignatureExtractor,
    spec: CommandSpec,
}

impl Verifier {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        extractor: SignatureExtractor,
        command: impl Into<String>,
        cwd: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            extractor,
            spec: CommandSpec::new(command, cwd, timeout),
        }
    }

    pub fn command(&self) -> &str {
        &self.spec.command
    }

    /// Run the verification command and compare it with `original`.
    ///
    /// The run is returned alongside the result so a failed verification can
    /// be reported with its own output.
    pub async fn verify(
        &self,
        original: &ErrorSignature,
    ) -> Result<(VerificationResult, Run), ExecError> {
        let run = self.runner.run(&self.spec).await?;
        let result = self.classify(original, &run);
        tracing::info!(
            command = %self.spec.command,
            exit_code = ?run.exit_code(),
            result = %result,
            "verification finished"
        );
        Ok((result, run))
    }

    /// Classify `run` relative to `original`.
    ///
    /// An unrecognized failure whose fallback fingerprint equals the original
    /// still counts as the same error, so an unparseable failure that does not
    /// change can be retried.
    pub fn classify(&self, original: &ErrorSignature, run: &Run) -> VerificationResult {
        if run.is_timed_out() {
            return VerificationResult::FailUnrelated {
                reason: UnrelatedReason::Timeout,
            };
        }
        if run.succeeded() {
            return VerificationResult::Pass;
        }
        let Some(signature) = self.extractor.extract_or_fallback(run) else {
            return VerificationResult::FailUnrelated {
                reason: UnrelatedReason::Unclassified,
            };
        };
        if signature.fingerprint() == original.fingerprint() {
            VerificationResult::FailSameError
        } else if signature.is_recognized() {
            VerificationResult::FailNewError { signature }
        } else {
            VerificationResult::FailUnrelated {
                reason: UnrelatedReason::Unclassified,
            }
        }
    }
}
