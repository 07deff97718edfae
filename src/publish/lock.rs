//! Exclusive per-repository publish lock.

use anyhow::Context;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{ForgeError, ForgeResult};

pub const LOCK_FILE: &str = ".publish.lock";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// RAII guard: the lock is released when the file handle closes.
///
/// The lock file itself is never unlinked. Removing a file another
/// process still holds would let a third one lock a fresh inode at the
/// same path.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    /// Lock `repo_dir`, waiting up to `timeout` for a concurrent publish.
    pub fn acquire(repo_dir: &Path, timeout: Duration) -> ForgeResult<Self> {
        fs::create_dir_all(repo_dir)
            .with_context(|| format!("Failed to create {}", repo_dir.display()))?;
        let path = repo_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

        let deadline = Instant::now() + timeout;
        loop {
            if file.try_lock_exclusive().is_ok() {
                tracing::debug!(path = %path.display(), "publish lock acquired");
                return Ok(Self { file, path });
            }
            if Instant::now() >= deadline {
                return Err(ForgeError::PublishConflict {
                    path: repo_dir.to_path_buf(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
