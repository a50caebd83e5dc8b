//! SQLite implementation of the FixMemory port.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::cmp::Reverse;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{format_datetime, parse_datetime};
use crate::domain::errors::StoreError;
use crate::domain::models::{ErrorSignature, Frame, MemoryEntry, Patch, RecordMeta};
use crate::domain::ports::FixMemory;

const COLUMNS: &str = "fingerprint, patch, success_count, last_used, error_class, \
                       top_frame_file, top_frame_line, created_at";

/// Fix memory backed by the `fix_memory` table.
///
/// Writes go through a single upsert statement, so the compare-and-increment
/// of the success count is atomic inside `SQLite`. The in-process mutex keeps
/// this process's writers from contending for the database write lock; other
/// processes are handled by WAL mode and the pool's busy timeout.
#[derive(Clone)]
pub struct SqliteFixMemory {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl SqliteFixMemory {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    async fn candidates(&self, class: &str, file: &str) -> Result<Vec<MemoryEntry>, StoreError> {
        let rows: Vec<FixMemoryRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM fix_memory WHERE error_class = ? AND top_frame_file = ?"
        ))
        .bind(class)
        .bind(file)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[async_trait]
impl FixMemory for SqliteFixMemory {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<MemoryEntry>, StoreError> {
        let row: Option<FixMemoryRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM fix_memory WHERE fingerprint = ?"))
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn lookup_similar(
        &self,
        signature: &ErrorSignature,
        exclude: &[String],
    ) -> Result<Option<MemoryEntry>, StoreError> {
        let Some(frame) = signature.frame() else {
            return Ok(None);
        };

        let mut candidates: Vec<MemoryEntry> = self
            .candidates(signature.class(), &frame.file)
            .await?
            .into_iter()
            .filter(|entry| {
                entry.fingerprint != signature.fingerprint()
                    && !exclude.iter().any(|fp| fp == &entry.fingerprint)
            })
            .collect();

        candidates.sort_by_key(|entry| {
            let distance = entry
                .top_frame
                .as_ref()
                .map_or(u32::MAX, |f| f.line.abs_diff(frame.line));
            (distance, Reverse(entry.last_used), entry.fingerprint.clone())
        });

        Ok(candidates.into_iter().next())
    }

    async fn record(
        &self,
        signature: &ErrorSignature,
        patch: &Patch,
        meta: RecordMeta,
    ) -> Result<MemoryEntry, StoreError> {
        if !meta.verification.is_pass() {
            return Err(StoreError::NotVerified(meta.verification));
        }

        let _guard = self.writer.lock().await;
        let now = format_datetime(meta.recorded_at);
        let frame = signature.frame();

        // Same patch bumps the count; a different patch supersedes and restarts at 1.
        let row: FixMemoryRow = sqlx::query_as(&format!(
            r"INSERT INTO fix_memory ({COLUMNS})
              VALUES (?, ?, 1, ?, ?, ?, ?, ?)
              ON CONFLICT(fingerprint) DO UPDATE SET
                  success_count = CASE WHEN fix_memory.patch = excluded.patch
                                       THEN fix_memory.success_count + 1
                                       ELSE 1 END,
                  created_at = CASE WHEN fix_memory.patch = excluded.patch
                                    THEN fix_memory.created_at
                                    ELSE excluded.created_at END,
                  patch = excluded.patch,
                  last_used = excluded.last_used,
                  error_class = excluded.error_class,
                  top_frame_file = excluded.top_frame_file,
                  top_frame_line = excluded.top_frame_line
              RETURNING {COLUMNS}"
        ))
        .bind(signature.fingerprint())
        .bind(patch.raw().as_bytes())
        .bind(&now)
        .bind(signature.class())
        .bind(frame.map(|f| f.file.as_str()))
        .bind(frame.map(|f| i64::from(f.line)))
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        let entry = MemoryEntry::try_from(row)?;
        tracing::debug!(
            fingerprint = %entry.fingerprint,
            success_count = entry.success_count,
            "recorded fix"
        );
        Ok(entry)
    }

    async fn hints(
        &self,
        signature: &ErrorSignature,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        let rows: Vec<FixMemoryRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM fix_memory
             WHERE error_class = ? AND fingerprint != ?
             ORDER BY success_count DESC, last_used DESC, fingerprint ASC
             LIMIT ?"
        ))
        .bind(signature.class())
        .bind(signature.fingerprint())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list(&self, limit: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        let rows: Vec<FixMemoryRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM fix_memory
             ORDER BY last_used DESC, fingerprint ASC
             LIMIT ?"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct FixMemoryRow {
    fingerprint: String,
    patch: Vec<u8>,
    success_count: i64,
    last_used: String,
    error_class: String,
    top_frame_file: Option<String>,
    top_frame_line: Option<i64>,
    created_at: String,
}

impl TryFrom<FixMemoryRow> for MemoryEntry {
    type Error = StoreError;

    fn try_from(row: FixMemoryRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: &str| StoreError::CorruptEntry {
            fingerprint: row.fingerprint.clone(),
            reason: reason.to_string(),
        };

        let patch = String::from_utf8(row.patch).map_err(|_| corrupt("patch is not UTF-8"))?;
        let success_count =
            u32::try_from(row.success_count).map_err(|_| corrupt("success count out of range"))?;
        let top_frame = match (row.top_frame_file, row.top_frame_line) {
            (Some(file), Some(line)) => Some(Frame::new(
                file,
                u32::try_from(line).map_err(|_| corrupt("frame line out of range"))?,
            )),
            _ => None,
        };

        Ok(Self {
            last_used: parse_datetime(&row.last_used)?,
            created_at: parse_datetime(&row.created_at)?,
            fingerprint: row.fingerprint,
            error_class: row.error_class,
            top_frame,
            patch,
            success_count,
        })
    }
}
