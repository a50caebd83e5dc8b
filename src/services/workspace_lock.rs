//! Exclusive per-project lock.
//!
//! Only one fix loop may mutate a working tree at a time. The lock is an
//! advisory `flock` on a file under the fixloop state directory, named after
//! the canonical project root so the project tree itself is never touched.
//! It is released when the guard drops, including on error paths.

use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::domain::errors::LockError;
use crate::domain::models::signature::hex_digest;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held while a loop owns the project. Dropping it releases the lock.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Lock file path used for `root` inside `lock_dir`.
    pub fn lock_path(lock_dir: &Path, root: &Path) -> PathBuf {
        let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        let digest = hex_digest(hasher);
        lock_dir.join(format!("{}.lock", &digest[..16]))
    }

    /// Acquire the lock for `root`, waiting up to `timeout` for another holder.
    pub async fn acquire(lock_dir: &Path, root: &Path, timeout: Duration) -> Result<Self, LockError> {
        let path = Self::lock_path(lock_dir, root);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(lock_dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    if start.elapsed() >= timeout {
                        return Err(LockError::Busy(path));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => return Err(io_err(err)),
            }
        }

        // Holder pid for whoever finds the lock busy
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        tracing::debug!(lock = %path.display(), root = %root.display(), "workspace lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(lock = %self.path.display(), "workspace lock released");
    }
}
