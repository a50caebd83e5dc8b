use crate::domain::errors::StoreError;
use crate::domain::models::{ErrorSignature, MemoryEntry, Patch, RecordMeta};
use async_trait::async_trait;

/// Persistent store of verified fixes keyed by error fingerprint.
///
/// Implementations must keep at most one entry per fingerprint and must only
/// accept writes whose [`RecordMeta::verification`] passed. Concurrent writers
/// from independent loops must not corrupt entries.
#[async_trait]
pub trait FixMemory: Send + Sync {
    /// Exact lookup by fingerprint
    async fn lookup(&self, fingerprint: &str) -> Result<Option<MemoryEntry>, StoreError>;

    /// Best entry with the same error class and top-frame file as `signature`
    ///
    /// Candidates are ranked by line distance from the signature's top
    /// frame, then most recently used, then fingerprint. The signature's own
    /// fingerprint and everything in `exclude` are skipped. Signatures
    /// without a frame never match.
    async fn lookup_similar(
        &self,
        signature: &ErrorSignature,
        exclude: &[String],
    ) -> Result<Option<MemoryEntry>, StoreError>;

    /// Store or refresh the fix for `signature`
    ///
    /// Recording the patch already stored for this fingerprint increments the
    /// success count and refreshes `last_used`. A different patch replaces the
    /// stored one and restarts the count at 1.
    ///
    /// # Errors
    /// Returns [`StoreError::NotVerified`] if `meta.verification` is not a pass.
    async fn record(
        &self,
        signature: &ErrorSignature,
        patch: &Patch,
        meta: RecordMeta,
    ) -> Result<MemoryEntry, StoreError>;

    /// Past fixes for the same error class, most used first, for generator hints
    async fn hints(
        &self,
        signature: &ErrorSignature,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError>;

    /// Most recently used entries first
    async fn list(&self, limit: usize) -> Result<Vec<MemoryEntry>, StoreError>;
}
