// SPDX-License-Identifier: Apache-2.0

//! The Rollback Driver (spec.md §4.9): on demand, restores every known
//! container's limits from the State Store. Does not run the control
//! loop — it is a one-shot path invoked via `--rollback`.

use crate::event_log::{Action, EventLog};
use crate::executor::{HostExecutor, DEFAULT_TIMEOUT};
use crate::state_store::StateStore;
use anyhow::Result;
use log::{info, warn};

pub async fn run(executor: &dyn HostExecutor, state_store: &StateStore, event_log: &EventLog) -> Result<()> {
    let mut entries = std::fs::read_dir(state_store.dir())?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_suffix(".json").map(|id| id.to_string())
        })
        .collect::<Vec<_>>();
    entries.sort();

    for container_id in entries {
        let record = match state_store.load(&container_id) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                let _ = event_log.record(
                    &container_id,
                    Action::Error,
                    None,
                    format!("rollback: failed to load backup: {e}"),
                );
                continue;
            }
        };

        let cores_argv = vec![
            "pct".to_string(),
            "set".to_string(),
            container_id.clone(),
            "-cores".to_string(),
            record.cores.to_string(),
        ];
        let memory_argv = vec![
            "pct".to_string(),
            "set".to_string(),
            container_id.clone(),
            "-memory".to_string(),
            record.memory_mib.to_string(),
        ];

        let cores_ok = executor.run(&cores_argv, DEFAULT_TIMEOUT).await.is_ok();
        let memory_ok = executor.run(&memory_argv, DEFAULT_TIMEOUT).await.is_ok();

        if cores_ok && memory_ok {
            info!("container {container_id}: rolled back to cores={} memory={}", record.cores, record.memory_mib);
            let _ = event_log.record(
                &container_id,
                Action::Rollback,
                None,
                format!("restored cores={} memory_mib={}", record.cores, record.memory_mib),
            );
        } else {
            warn!("container {container_id}: rollback command(s) failed");
            let _ = event_log.record(
                &container_id,
                Action::Error,
                None,
                "rollback: one or more restore commands failed".to_string(),
            );
        }
    }

    Ok(())
}
