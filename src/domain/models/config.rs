use serde::{Deserialize, Serialize};

/// Main configuration structure for fixloop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Loop bounds and timeouts
    #[serde(default, rename = "loop")]
    pub fix_loop: LoopSettings,

    /// Diff guard policy
    #[serde(default)]
    pub guard: GuardSettings,

    /// Fix memory store
    #[serde(default)]
    pub memory: MemorySettings,

    /// Patch generator backend
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoopSettings {
    /// Maximum patch attempts per invocation. There is no default: it must
    /// come from a config file, `FIXLOOP_LOOP__MAX_ATTEMPTS`, or
    /// `--max-attempts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Time limit for the failing command
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Time limit for each verification run, defaults to `command_timeout_secs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_timeout_secs: Option<u64>,

    /// How long to wait for an approval answer, unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_secs: Option<u64>,

    /// Apply guard-approved patches without asking
    #[serde(default = "default_true")]
    pub auto_apply: bool,

    /// How long to wait for another loop to release the workspace
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Per-file byte cap for source context sent to the generator
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
}

const fn default_command_timeout_secs() -> u64 {
    300
}

const fn default_lock_timeout_secs() -> u64 {
    10
}

const fn default_max_context_bytes() -> usize {
    64 * 1024
}

const fn default_true() -> bool {
    true
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            command_timeout_secs: default_command_timeout_secs(),
            verify_timeout_secs: None,
            approval_timeout_secs: None,
            auto_apply: true,
            lock_timeout_secs: default_lock_timeout_secs(),
            max_context_bytes: default_max_context_bytes(),
        }
    }
}

/// Diff guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GuardSettings {
    /// Added plus removed lines above which a patch is blocked
    #[serde(default = "default_max_changed_lines")]
    pub max_changed_lines: usize,

    /// Glob patterns for paths that always need a human
    #[serde(default = "default_sensitive_paths")]
    pub sensitive_paths: Vec<String>,
}

const fn default_max_changed_lines() -> usize {
    60
}

/// Credentials, keys, and infrastructure manifests.
pub fn default_sensitive_paths() -> Vec<String> {
    [
        ".env",
        ".env.*",
        "*.pem",
        "*.key",
        "*.p12",
        "id_rsa*",
        "**/.ssh/**",
        "**/secrets/**",
        "**/*credentials*",
        "*.tf",
        "*.tfvars",
        "**/k8s/**",
        "**/helm/**",
        "Dockerfile",
        "docker-compose*.yml",
        "docker-compose*.yaml",
        ".github/workflows/**",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_changed_lines: default_max_changed_lines(),
            sensitive_paths: default_sensitive_paths(),
        }
    }
}

/// Fix memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MemorySettings {
    /// Path to the `SQLite` database, `~/.fixloop/fixloop.db` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,

    /// Fall back to entries with the same class and file when there is no exact match
    #[serde(default = "default_true")]
    pub similarity: bool,

    /// Number of related past fixes sent to the generator as hints
    #[serde(default = "default_hint_limit")]
    pub hint_limit: usize,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

const fn default_hint_limit() -> usize {
    3
}

const fn default_max_connections() -> u32 {
    4
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            database_path: None,
            similarity: true,
            hint_limit: default_hint_limit(),
            max_connections: default_max_connections(),
        }
    }
}

/// Patch generator backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProviderSettings {
    /// Backend kind; only `openai` (any OpenAI-compatible endpoint) is built in
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    /// Model name sent with each request
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the chat completions API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key, falls back to `OPENAI_API_KEY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// HTTP request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Completion token cap
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_provider_kind() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    120
}

const fn default_max_tokens() -> u32 {
    4096
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            model: default_model(),
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rotated JSON log files, stderr only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Rotation for file logs: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
