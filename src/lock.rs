// SPDX-License-Identifier: Apache-2.0

//! The singleton daemon lock (spec.md §4.9, §6): a non-blocking advisory
//! exclusive lock on a fixed path, so a second instance fails fast instead
//! of racing the first (spec.md §8 "Singleton"). Mirrors
//! `original_source/lxc_autoscale/lock_manager.py`'s `fcntl.lockf` guard.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct SingletonLock {
    _file: File,
    path: PathBuf,
}

impl SingletonLock {
    /// Acquires the lock or returns an error if another instance already
    /// holds it. Held for the lifetime of the returned guard; released on
    /// drop (or process exit).
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!(
                "another instance already holds the lock at {}",
                path.display()
            );
        }

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self._file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_first_acquire_succeeds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hv-autoscale.lock");
        let lock = SingletonLock::acquire(&path);
        assert!(lock.is_ok());
    }

    #[test]
    fn test_second_acquire_on_same_path_fails_while_first_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hv-autoscale.lock");
        let _first = SingletonLock::acquire(&path).unwrap();
        let second = SingletonLock::acquire(&path);
        assert!(second.is_err());
    }

    #[test]
    fn test_lock_released_after_drop_allows_reacquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hv-autoscale.lock");
        {
            let _first = SingletonLock::acquire(&path).unwrap();
        }
        let second = SingletonLock::acquire(&path);
        assert!(second.is_ok());
    }
}
