use fs4::tokio::AsyncFileExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::{error, info};

async fn exclusive_lock(lock_path: &Path) -> std::io::Result<File> {
    let lock_file = File::create(lock_path).await?;
    if lock_file.try_lock_exclusive()? {
        Ok(lock_file)
    } else {
        info!(
            "{} is locked by another process. Waiting for it to finish...",
            lock_path.display()
        );
        tokio::task::spawn_blocking(move || {
            lock_file.lock_exclusive()?;
            Ok(lock_file)
        })
        .await?
    }
}

/// An exclusive advisory lock on a file, held until dropped.
///
/// Serializes work on shared on-disk state between processes. Within one process, callers still need
/// their own mutex: advisory locks are per file handle and do not block other tasks of the same process
/// on every platform.
#[must_use]
#[clippy::has_significant_drop]
#[derive(Debug)]
pub struct FileLock {
    lock_file: File,
    path: PathBuf,
}

impl FileLock {
    pub async fn exclusive(lock_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = lock_path.into();
        let lock_file = exclusive_lock(&path).await?;
        Ok(Self { lock_file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            error!("Failed to release lock {}: {e}", self.path.display());
        }
    }
}
