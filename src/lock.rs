//! Exclusive lock on a storage root.
//!
//! The engine assumes single-process ownership of its directory; a second
//! opener must fail fast instead of interleaving writes.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::constants::LOCK_FILE_NAME;
use crate::error::{Result, VaultError};

/// Held for the lifetime of an open engine; releasing the file releases the
/// OS lock.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Acquire the exclusive lock for `root`, creating the lock file if needed.
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE_NAME);
        let file = fs_err::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?
            .into_parts()
            .0;
        file.try_lock_exclusive().map_err(|err| {
            VaultError::Lock(format!(
                "storage root {} is owned by another process: {err}",
                root.display()
            ))
        })?;
        tracing::debug!(lock.path = %path.display(), "acquired storage lock");
        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(error = %err, "failed to release storage lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails() {
        let dir = tempdir().expect("tmp");
        let held = DirLock::acquire(dir.path()).expect("first lock");
        let err = DirLock::acquire(dir.path()).expect_err("second lock must fail");
        assert!(matches!(err, VaultError::Lock(_)));
        drop(held);
        DirLock::acquire(dir.path()).expect("relock after release");
    }
}
