// SPDX-License-Identifier: Apache-2.0

//! The State Store (spec.md §4.3): one backup record per container,
//! persisted as its own file so a crash mid-write never corrupts another
//! container's record. Writes are atomic via write-to-temp-then-rename,
//! the same durability pattern the teacher's `state.rs` uses for its
//! process registry snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The pre-scaling resource snapshot for one container (spec.md §3
/// `BackupRecord`). Intentionally narrow: cores and memory only, even once
/// the supplemental disk-scaling pass is enabled, so rollback never
/// surprises an operator with an unexpected resize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub cores: u32,
    pub memory_mib: u64,
}

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, container_id: &str) -> PathBuf {
        self.dir.join(format!("{container_id}.json"))
    }

    pub fn save(&self, container_id: &str, record: BackupRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating backup dir {}", self.dir.display()))?;
        let target = self.path_for(container_id);
        let tmp = target.with_extension("json.tmp");
        let body =
            serde_json::to_vec_pretty(&record).context("serializing backup record")?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &target)
            .with_context(|| format!("renaming {} into place", target.display()))?;
        Ok(())
    }

    pub fn load(&self, container_id: &str) -> Result<Option<BackupRecord>> {
        let path = self.path_for(container_id);
        if !path.exists() {
            return Ok(None);
        }
        let body = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let record = serde_json::from_slice(&body)
            .with_context(|| format!("parsing backup record {}", path.display()))?;
        Ok(Some(record))
    }

    pub fn remove(&self, container_id: &str) -> Result<()> {
        let path = self.path_for(container_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let record = BackupRecord {
            cores: 2,
            memory_mib: 1024,
        };
        store.save("101", record).unwrap();
        assert_eq!(store.load("101").unwrap(), Some(record));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.load("999").unwrap(), None);
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store
            .save("101", BackupRecord { cores: 2, memory_mib: 1024 })
            .unwrap();
        store
            .save("101", BackupRecord { cores: 4, memory_mib: 2048 })
            .unwrap();
        assert_eq!(
            store.load("101").unwrap(),
            Some(BackupRecord { cores: 4, memory_mib: 2048 })
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.remove("101").unwrap();
        store
            .save("101", BackupRecord { cores: 1, memory_mib: 512 })
            .unwrap();
        store.remove("101").unwrap();
        assert_eq!(store.load("101").unwrap(), None);
    }
}
