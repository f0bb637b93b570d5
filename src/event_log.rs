// SPDX-License-Identifier: Apache-2.0

//! The Event Log (spec.md §3, §4.4): an append-only newline-delimited JSON
//! stream of every scaling decision, serialized with a mutex on appends
//! (spec.md §5). Never read back by the daemon itself — it exists purely
//! as an audit trail, mirrored line-for-line into the human-readable log
//! via `log::info!` (SPEC_FULL §4.4).

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// The closed action-tag set from spec.md §3, extended (additively, per
/// SPEC_FULL §4.7) with the two supplemental disk-scaling tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    IncreaseCores,
    DecreaseCores,
    IncreaseMemory,
    DecreaseMemory,
    OffPeakClampCores,
    OffPeakClampMemory,
    ScaleOut,
    ScaleIn,
    Rollback,
    IncreaseStorage,
    DecreaseStorage,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub host: String,
    pub container_id: String,
    pub action: Action,
    pub delta: Option<f64>,
    pub detail: String,
}

pub struct EventLog {
    path: PathBuf,
    host: String,
    file: Mutex<std::fs::File>,
}

impl EventLog {
    pub fn open(path: impl Into<PathBuf>, host: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating event log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self {
            path,
            host: host.into(),
            file: Mutex::new(file),
        })
    }

    pub fn record(
        &self,
        container_id: &str,
        action: Action,
        delta: Option<f64>,
        detail: impl Into<String>,
    ) -> Result<()> {
        let detail = detail.into();
        let record = EventRecord {
            timestamp: now_rfc3339(),
            host: self.host.clone(),
            container_id: container_id.to_string(),
            action,
            delta,
            detail: detail.clone(),
        };
        let mut line = serde_json::to_vec(&record).context("serializing event record")?;
        line.push(b'\n');

        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        file.write_all(&line)
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush().context("flushing event log")?;
        drop(file);

        info!(
            "{container_id}: {action:?} delta={delta:?} {detail}",
            action = record.action
        );
        Ok(())
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string())
}
