//! Interactive approval on the controlling terminal.

use async_trait::async_trait;
use console::{style, Term};

use crate::domain::models::Patch;
use crate::domain::ports::{ApprovalAnswer, ApprovalGate, ApprovalPrompt};

/// Shows the full diff on stderr and reads a yes/no answer.
///
/// Without an interactive terminal every request is answered `Cancelled`,
/// which the loop treats as a rejection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalApproval;

impl TerminalApproval {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ApprovalGate for TerminalApproval {
    async fn request(&self, patch: &Patch, prompt: ApprovalPrompt<'_>) -> ApprovalAnswer {
        let header = match prompt {
            ApprovalPrompt::Blocked(violation) => format!(
                "{} {violation}",
                style("Patch blocked by policy:").red().bold()
            ),
            ApprovalPrompt::Confirm => style("Proposed patch:").bold().to_string(),
        };
        let body = render_diff(patch);

        // Reading stdin blocks, keep it off the runtime
        let answer = tokio::task::spawn_blocking(move || ask(&header, &body)).await;
        answer.unwrap_or(ApprovalAnswer::Cancelled)
    }
}

fn ask(header: &str, body: &str) -> ApprovalAnswer {
    let term = Term::stderr();
    if !term.is_term() {
        tracing::warn!("approval needed but no terminal is attached");
        return ApprovalAnswer::Cancelled;
    }
    let shown = term
        .write_line(header)
        .and_then(|()| term.write_line(body))
        .and_then(|()| term.write_str("Apply this patch? [y/N] "));
    if shown.is_err() {
        return ApprovalAnswer::Cancelled;
    }
    match term.read_line() {
        Ok(line) => parse_answer(&line),
        Err(_) => ApprovalAnswer::Cancelled,
    }
}

fn parse_answer(line: &str) -> ApprovalAnswer {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalAnswer::Approve,
        _ => ApprovalAnswer::Reject,
    }
}

/// Colored unified diff.
pub fn render_diff(patch: &Patch) -> String {
    patch
        .raw()
        .lines()
        .map(|line| {
            if line.starts_with("+++") || line.starts_with("---") {
                style(line).bold().to_string()
            } else if line.starts_with("@@") {
                style(line).cyan().to_string()
            } else if line.starts_with('+') {
                style(line).green().to_string()
            } else if line.starts_with('-') {
                style(line).red().to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
