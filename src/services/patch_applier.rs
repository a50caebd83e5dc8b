//! Writes approved patches into the working tree and can undo them.
//!
//! Applying is two-phase. Every hunk of every file is resolved against the
//! current contents in memory first, so a conflict leaves the tree untouched.
//! Only then are files replaced, each through a temp file and a rename next
//! to the resolved target, so a symlinked path keeps its link. The original
//! bytes are kept until the patch is committed or reverted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::domain::errors::ApplyError;
use crate::domain::models::ApprovedPatch;

/// Original contents of one file touched by the pending patch.
#[derive(Debug)]
struct Backup {
    path: PathBuf,
    original: Vec<u8>,
}

#[derive(Debug)]
struct Pending {
    digest: String,
    backups: Vec<Backup>,
}

/// Applies at most one patch at a time to the tree under `root`.
#[derive(Debug)]
pub struct PatchApplier {
    root: PathBuf,
    pending: Option<Pending>,
}

impl PatchApplier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: None,
        }
    }

    /// True while an applied patch waits for `commit` or `revert`.
    pub const fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Apply `approved` to the tree.
    ///
    /// # Errors
    /// - `PatchAlreadyPending` if a previous patch was not committed or reverted
    /// - `MissingTarget` / `Conflict` before anything is written
    /// - `Io` if a write fails; files already replaced are restored first
    pub fn apply(&mut self, approved: &ApprovedPatch) -> Result<(), ApplyError> {
        if self.pending.is_some() {
            return Err(ApplyError::PatchAlreadyPending);
        }
        let patch = approved.patch();

        // Phase one: resolve everything in memory
        let mut staged: Vec<(PathBuf, Vec<u8>, String)> = Vec::with_capacity(patch.files().len());
        for file in patch.files() {
            let rel = file.path();
            // Symlinks are written through, never replaced
            let target = match fs::canonicalize(self.root.join(rel)) {
                Ok(target) => target,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(ApplyError::MissingTarget {
                        path: rel.to_string(),
                    });
                }
                Err(source) => {
                    return Err(ApplyError::Io {
                        path: self.root.join(rel),
                        source,
                    })
                }
            };
            let original = fs::read(&target).map_err(|source| ApplyError::Io {
                path: target.clone(),
                source,
            })?;
            let text = String::from_utf8(original.clone()).map_err(|err| ApplyError::Io {
                path: target.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, err),
            })?;
            let updated = file.apply_to(&text).map_err(|source| ApplyError::Conflict {
                path: rel.to_string(),
                source,
            })?;
            staged.push((target, original, updated));
        }

        // Phase two: replace files, undoing on the first failure
        let mut backups: Vec<Backup> = Vec::with_capacity(staged.len());
        for (path, original, updated) in staged {
            if let Err(source) = write_atomic(&path, updated.as_bytes()) {
                restore(&backups);
                return Err(ApplyError::Io { path, source });
            }
            backups.push(Backup { path, original });
        }

        tracing::info!(
            digest = %patch.digest(),
            files = backups.len(),
            origin = %patch.origin(),
            "patch applied"
        );
        self.pending = Some(Pending {
            digest: patch.digest().to_string(),
            backups,
        });
        Ok(())
    }

    /// Restore every file touched by the pending patch.
    ///
    /// # Errors
    /// `NothingPending` if no patch is applied, `Io` if a restore fails. On
    /// `Io` the remaining files are still restored.
    pub fn revert(&mut self) -> Result<(), ApplyError> {
        let pending = self.pending.take().ok_or(ApplyError::NothingPending)?;
        let mut first_error = None;
        for backup in &pending.backups {
            if let Err(source) = write_atomic(&backup.path, &backup.original) {
                tracing::error!(path = %backup.path.display(), error = %source, "failed to restore file");
                first_error.get_or_insert(ApplyError::Io {
                    path: backup.path.clone(),
                    source,
                });
            }
        }
        tracing::info!(digest = %pending.digest, "patch reverted");
        first_error.map_or(Ok(()), Err)
    }

    /// Keep the pending patch and drop its backups.
    ///
    /// # Errors
    /// `NothingPending` if no patch is applied
    pub fn commit(&mut self) -> Result<(), ApplyError> {
        let pending = self.pending.take().ok_or(ApplyError::NothingPending)?;
        tracing::debug!(digest = %pending.digest, "patch committed");
        Ok(())
    }
}

fn restore(backups: &[Backup]) {
    for backup in backups.iter().rev() {
        if let Err(err) = write_atomic(&backup.path, &backup.original) {
            tracing::error!(path = %backup.path.display(), error = %err, "failed to roll back file");
        }
    }
}

/// Replace `path` with `content` via a sibling temp file and a rename.
///
/// The original permissions are carried over to the new file.
fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".fixloop.tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, content)?;
    if let Ok(meta) = fs::metadata(path) {
        let _ = fs::set_permissions(&tmp_path, meta.permissions());
    }

    #[cfg(windows)]
    {
        // rename() does not replace an existing file here
        if path.exists() {
            if let Err(err) = fs::remove_file(path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
