//! OpenAI-compatible chat completions adapter for the patch generator port.
//!
//! One request per call, no retries: the loop treats any failure here as
//! terminal for the attempt. The key is sent only to the configured base URL.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

use crate::domain::errors::GenerationError;
use crate::domain::models::ProviderSettings;
use crate::domain::ports::{PatchGenerator, PatchRequest, PatchResponse};
use crate::infrastructure::credentials::ApiKey;

/// Literal the model answers with when it cannot propose a safe change.
pub const NO_PATCH_MARKER: &str = "NO_PATCH";

const OUTPUT_TAIL_LINES: usize = 80;

const SYSTEM_PROMPT: &str = "You fix failing commands by proposing the smallest possible change.\n\
Answer with a single unified diff and nothing else.\n\
Rules:\n\
- Use `--- a/<path>` and `+++ b/<path>` headers with paths relative to the project root.\n\
- Only modify existing lines of existing files. Never create, delete or rename files.\n\
- Include enough context lines for every hunk to apply.\n\
- Change as few lines as possible. Do not reformat or refactor.\n\
- If no safe minimal change exists, answer exactly NO_PATCH followed by a colon and a short reason.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Patch generator backed by any OpenAI-compatible endpoint.
pub struct OpenAiPatchGenerator {
    client: Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    api_key: Option<ApiKey>,
}

impl OpenAiPatchGenerator {
    /// Build the adapter. A missing key is only reported when a patch is
    /// actually requested, so replays from memory work without one.
    pub fn new(settings: &ProviderSettings, api_key: Option<ApiKey>) -> Result<Self, GenerationError> {
        if settings.kind != "openai" {
            return Err(GenerationError::NotConfigured(format!(
                "unsupported provider kind '{}'",
                settings.kind
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| GenerationError::NotConfigured(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl PatchGenerator for OpenAiPatchGenerator {
    async fn generate(&self, request: &PatchRequest) -> Result<PatchResponse, GenerationError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            GenerationError::NotConfigured(format!(
                "no API key; set provider.api_key or {}",
                crate::infrastructure::credentials::API_KEY_ENV
            ))
        })?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_prompt(request),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        tracing::debug!(
            model = %self.model,
            fingerprint = %request.signature.fingerprint(),
            files = request.files.len(),
            prior_attempts = request.prior_attempts.len(),
            "requesting patch"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::MalformedResponse("response has no choices".to_string()))?
            .message
            .content
            .unwrap_or_default();

        Ok(interpret_content(&content))
    }
}

fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    let excerpt: String = body.chars().take(200).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerationError::InvalidCredential,
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            GenerationError::Unreachable(format!("HTTP {s}: {excerpt}"))
        }
        s => GenerationError::MalformedResponse(format!("HTTP {s}: {excerpt}")),
    }
}

/// Turn the model's text into a response, stripping markdown fences.
fn interpret_content(content: &str) -> PatchResponse {
    let text = strip_code_fence(content).trim();
    if text.is_empty() {
        return PatchResponse::NoPatch { reason: None };
    }
    if let Some(rest) = text.strip_prefix(NO_PATCH_MARKER) {
        let reason = rest.trim_start_matches(':').trim();
        return PatchResponse::NoPatch {
            reason: (!reason.is_empty()).then(|| reason.to_string()),
        };
    }
    PatchResponse::Diff(format!("{text}\n"))
}

/// Contents of the first fenced block, or the input unchanged.
fn strip_code_fence(content: &str) -> &str {
    let Some(open) = content.find("```") else {
        return content;
    };
    let after_open = &content[open + 3..];
    // Skip the info string (`diff`, `patch`, ...)
    let Some(newline) = after_open.find('\n') else {
        return content;
    };
    let inner = &after_open[newline + 1..];
    inner.find("```").map_or(inner, |close| &inner[..close])
}

fn build_prompt(request: &PatchRequest) -> String {
    let mut prompt = String::new();
    let exit = request
        .exit_code
        .map_or_else(|| "killed".to_string(), |code| code.to_string());
    let _ = writeln!(prompt, "Command: {}", request.command);
    let _ = writeln!(prompt, "Exit status: {exit}");
    let _ = writeln!(prompt, "Error: {}", request.signature);
    if !request.signature.message().is_empty() {
        let _ = writeln!(prompt, "Message: {}", request.signature.message());
    }

    for (label, stream) in [("stderr", &request.stderr), ("stdout", &request.stdout)] {
        let tail = tail_lines(stream, OUTPUT_TAIL_LINES);
        if !tail.is_empty() {
            let _ = write!(prompt, "\n--- {label} (tail) ---\n{tail}\n");
        }
    }

    for file in &request.files {
        let marker = if file.truncated { " (truncated)" } else { "" };
        let _ = write!(
            prompt,
            "\n--- file: {}{marker} ---\n{}\n",
            file.path, file.contents
        );
    }

    for (index, attempt) in request.prior_attempts.iter().enumerate() {
        let _ = write!(
            prompt,
            "\n--- attempt {} failed ({}) ---\n{}",
            index + 1,
            attempt.result,
            attempt.diff
        );
    }

    if !request.memory_hints.is_empty() {
        prompt.push_str("\nFixes that worked for similar errors in this project:\n");
        for hint in &request.memory_hints {
            let _ = write!(prompt, "\n{hint}\n");
        }
    }

    prompt.push_str("\nReply with the unified diff only.\n");
    prompt
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(max)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ErrorSignature, Frame, VerificationResult};
    use crate::domain::ports::{FileContext, PriorAttempt};

    #[test]
    fn test_strip_code_fence() {
        let wrapped = "Here you go:\n```diff\n--- a/x\n+++ b/x\n```\nthanks";
        assert_eq!(strip_code_fence(wrapped), "--- a/x\n+++ b/x\n");
        assert_eq!(strip_code_fence("--- a/x\n"), "--- a/x\n");
    }

    #[test]
    fn test_no_patch_marker() {
        assert_eq!(
            interpret_content("NO_PATCH: needs a migration"),
            PatchResponse::NoPatch {
                reason: Some("needs a migration".to_string())
            }
        );
        assert_eq!(interpret_content("  "), PatchResponse::NoPatch { reason: None });
        assert_eq!(interpret_content("NO_PATCH"), PatchResponse::NoPatch { reason: None });
    }

    #[test]
    fn test_diff_gets_trailing_newline() {
        assert_eq!(
            interpret_content("```\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n```"),
            PatchResponse::Diff("--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n".to_string())
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            GenerationError::InvalidCredential
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream"),
            GenerationError::Unreachable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad"),
            GenerationError::MalformedResponse(_)
        ));
    }

    #[test]
    fn test_prompt_carries_context() {
        let request = PatchRequest {
            command: "pytest".to_string(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "ZeroDivisionError: division by zero".to_string(),
            signature: ErrorSignature::new(
                "ZeroDivisionError",
                "division by zero",
                Some(Frame::new("calc.py", 4)),
                vec!["calc.py".to_string()],
            ),
            files: vec![FileContext {
                path: "calc.py".to_string(),
                contents: "def f():\n    return 1 / 0\n".to_string(),
                truncated: false,
            }],
            prior_attempts: vec![PriorAttempt {
                diff: "--- a/calc.py\n".to_string(),
                result: VerificationResult::FailSameError,
            }],
            memory_hints: vec!["--- a/other.py\n".to_string()],
        };
        let prompt = build_prompt(&request);
        assert!(prompt.contains("Command: pytest"));
        assert!(prompt.contains("ZeroDivisionError at calc.py:4"));
        assert!(prompt.contains("--- file: calc.py ---"));
        assert!(prompt.contains("attempt 1 failed (same error persists)"));
        assert!(prompt.contains("similar errors"));
    }

    #[test]
    fn test_unsupported_kind_is_not_configured() {
        let settings = ProviderSettings {
            kind: "llama".to_string(),
            ..ProviderSettings::default()
        };
        assert!(matches!(
            OpenAiPatchGenerator::new(&settings, None),
            Err(GenerationError::NotConfigured(_))
        ));
    }
}
