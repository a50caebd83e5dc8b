//! Credentials management infrastructure
//!
//! API key resolution for the patch generator:
//! - Explicit `provider.api_key` from configuration
//! - `OPENAI_API_KEY` environment fallback
//! - Redacted `Debug` so keys never reach logs

use std::fmt;

use crate::domain::models::ProviderSettings;

/// Environment variable consulted when the config carries no key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// An API key that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a key, ignoring blank values.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Resolve the provider key, config first, then the environment.
pub fn resolve_api_key(provider: &ProviderSettings) -> Option<ApiKey> {
    provider
        .api_key
        .clone()
        .and_then(ApiKey::new)
        .or_else(|| std::env::var(API_KEY_ENV).ok().and_then(ApiKey::new))
}
