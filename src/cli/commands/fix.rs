//! Implementation of the `fixloop fix` command.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::openai::OpenAiPatchGenerator;
use crate::adapters::sqlite::{initialize_database_at, PoolConfig, SqliteFixMemory};
use crate::application::{FixLoop, LoopConfig, LoopOutcome, LoopReport, StateKind};
use crate::cli::approval::TerminalApproval;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, PatchOrigin};
use crate::infrastructure::config::{fixloop_home, resolve_database_path, ConfigLoader};
use crate::infrastructure::credentials::resolve_api_key;
use crate::infrastructure::logging::{LogConfig, LoggerImpl};
use crate::infrastructure::process::ShellCommandRunner;

#[derive(Args, Debug)]
pub struct FixArgs {
    /// Command to run and repair
    #[arg(long = "cmd", value_name = "CMD")]
    pub command: String,

    /// Command used to verify a patch (defaults to --cmd)
    #[arg(long, value_name = "CMD")]
    pub verify: Option<String>,

    /// Apply guard-approved patches without asking; blocked patches still ask
    #[arg(long, short)]
    pub yes: bool,

    /// Patch attempts allowed (overrides loop.max_attempts)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Changed-line ceiling (overrides guard.max_changed_lines)
    #[arg(long)]
    pub max_changed_lines: Option<usize>,

    /// Project root (defaults to current directory)
    #[arg(long, default_value = ".")]
    pub root: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct FixOutput {
    pub loop_id: String,
    pub command: String,
    pub status: &'static str,
    pub exit_code: i32,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub transitions: Vec<StateKind>,
    pub duration_ms: i64,
}

impl From<&LoopReport> for FixOutput {
    fn from(report: &LoopReport) -> Self {
        let (status, origin, success_count, error) = match &report.outcome {
            LoopOutcome::NoError => ("no_error", None, None, None),
            LoopOutcome::Resolved { entry, origin, .. } => {
                let origin = match origin {
                    PatchOrigin::Generated => "generated".to_string(),
                    PatchOrigin::ReplayedFromMemory { .. } => "memory".to_string(),
                };
                ("resolved", Some(origin), Some(entry.success_count), None)
            }
            LoopOutcome::Aborted(err) => ("aborted", None, None, Some(err.to_string())),
        };
        Self {
            loop_id: report.loop_id.to_string(),
            command: report.command.clone(),
            status,
            exit_code: report.exit_code(),
            attempts: report.attempts,
            signature: report.signature.as_ref().map(ToString::to_string),
            fingerprint: report
                .signature
                .as_ref()
                .map(|s| s.fingerprint().to_string()),
            origin,
            success_count,
            error,
            transitions: report.transitions.clone(),
            duration_ms: (report.finished_at - report.started_at).num_milliseconds(),
        }
    }
}

impl CommandOutput for FixOutput {
    fn to_human(&self) -> String {
        let mut lines = Vec::new();
        match self.status {
            "no_error" => lines.push(format!("`{}` succeeded, nothing to fix.", self.command)),
            "resolved" => {
                lines.push(format!(
                    "Fixed {} after {} attempt(s).",
                    self.signature.as_deref().unwrap_or("the failure"),
                    self.attempts
                ));
                if let (Some(origin), Some(count)) = (&self.origin, self.success_count) {
                    let source = if origin == "memory" {
                        "Replayed a remembered fix"
                    } else {
                        "Recorded a new fix"
                    };
                    lines.push(format!("{source} (used {count} time(s))."));
                }
            }
            _ => {
                lines.push(format!(
                    "Could not fix `{}`: {}",
                    self.command,
                    self.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Run the fix loop and return the process exit code.
pub async fn execute(args: FixArgs, json_mode: bool) -> Result<i32> {
    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("Project root {} does not exist", args.root.display()))?;

    let mut config = ConfigLoader::load(&root).context("Failed to load configuration")?;
    apply_overrides(&mut config, &args);
    ConfigLoader::validate(&config).context("Invalid configuration")?;
    let max_attempts = ConfigLoader::require_max_attempts(&config)?;

    let _logger = LoggerImpl::init(&LogConfig::from(&config.logging))
        .context("Failed to initialize logging")?;

    let db_path = resolve_database_path(&config.memory)?;
    let pool = initialize_database_at(
        &db_path,
        Some(PoolConfig {
            max_connections: config.memory.max_connections,
            ..PoolConfig::default()
        }),
    )
    .await
    .with_context(|| format!("Failed to open fix memory at {}", db_path.display()))?;

    let generator = OpenAiPatchGenerator::new(&config.provider, resolve_api_key(&config.provider))
        .context("Failed to configure patch generator")?;

    let mut loop_config = LoopConfig::from_config(
        &config,
        &root,
        &args.command,
        max_attempts,
        fixloop_home()?.join("locks"),
    );
    loop_config.verify_command = args.verify.clone();

    let fix_loop = FixLoop::new(
        loop_config,
        Arc::new(ShellCommandRunner),
        Arc::new(SqliteFixMemory::new(pool)),
        Arc::new(generator),
        Arc::new(TerminalApproval::new()),
    )
    .context("Invalid guard configuration")?;

    let report = fix_loop.run().await;
    output(&FixOutput::from(&report), json_mode);
    Ok(report.exit_code())
}

fn apply_overrides(config: &mut Config, args: &FixArgs) {
    if let Some(attempts) = args.max_attempts {
        config.fix_loop.max_attempts = Some(attempts);
    }
    if let Some(lines) = args.max_changed_lines {
        config.guard.max_changed_lines = lines;
    }
    if args.yes {
        config.fix_loop.auto_apply = true;
    }
}
