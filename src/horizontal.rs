// SPDX-License-Identifier: Apache-2.0

//! The Horizontal Scaler (spec.md §4.8): per configured group, computes
//! averaged utilization across live members and, subject to cooldowns,
//! clones the base container into a new member, or removes one on a
//! sustained low-utilization trough.

use crate::config::{CloneNetworkMode, HorizontalGroupConfig};
use crate::event_log::{Action, EventLog};
use crate::executor::{HostExecutor, CLONE_TIMEOUT, DEFAULT_TIMEOUT};
use crate::notifier::Notifier;
use crate::probe::ContainerSample;
use log::warn;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// In-memory, process-wide group state (spec.md §3 "last scale action
/// timestamp"). Never persisted: a restart simply makes every group
/// eligible again, matching the original source's in-process dict.
pub struct GroupState {
    pub members: Vec<String>,
    pub last_action: Option<Instant>,
}

impl GroupState {
    pub fn new(members: Vec<String>) -> Self {
        Self { members, last_action: None }
    }
}

pub async fn run_group(
    executor: &dyn HostExecutor,
    event_log: &EventLog,
    notifier: &dyn Notifier,
    group_name: &str,
    config: &HorizontalGroupConfig,
    state: &mut GroupState,
    samples: &HashMap<String, ContainerSample>,
    ignore: &[String],
) {
    let live: Vec<&String> = state
        .members
        .iter()
        .filter(|id| samples.contains_key(*id) && !ignore.contains(id))
        .collect();

    if live.is_empty() {
        let _ = event_log.record(
            group_name,
            Action::Error,
            None,
            "no live members, skipping horizontal evaluation".to_string(),
        );
        return;
    }

    let avg_cpu = live.iter().map(|id| samples[*id].cpu_pct).sum::<f64>() / live.len() as f64;
    let avg_mem = live.iter().map(|id| samples[*id].mem_pct).sum::<f64>() / live.len() as f64;

    let elapsed_since_last = state
        .last_action
        .map(|t| t.elapsed())
        .unwrap_or(Duration::MAX);

    let scale_out_ready = elapsed_since_last >= Duration::from_secs(config.scale_out_grace_secs)
        && (avg_cpu > config.horiz_cpu_upper || avg_mem > config.horiz_memory_upper)
        && (state.members.len() as u32) < config.max_members;

    let scale_in_ready = match (config.horiz_cpu_lower, config.horiz_memory_lower) {
        (Some(cpu_lower), Some(mem_lower)) => {
            elapsed_since_last >= Duration::from_secs(config.scale_in_grace_secs)
                && avg_cpu < cpu_lower
                && avg_mem < mem_lower
                && (state.members.len() as u32) > config.min_members
        }
        _ => false,
    };

    if scale_out_ready {
        scale_out(executor, event_log, notifier, group_name, config, state).await;
    } else if scale_in_ready {
        scale_in(executor, event_log, notifier, group_name, config, state).await;
    }
}

async fn scale_out(
    executor: &dyn HostExecutor,
    event_log: &EventLog,
    notifier: &dyn Notifier,
    group_name: &str,
    config: &HorizontalGroupConfig,
    state: &mut GroupState,
) {
    let numeric_members: Vec<u64> = state
        .members
        .iter()
        .filter_map(|id| id.parse().ok())
        .collect();
    let count_at_or_above_start = numeric_members
        .iter()
        .filter(|&&id| id >= config.starting_clone_id)
        .count() as u64;
    let new_id = config.starting_clone_id + count_at_or_above_start;
    let hostname = format!("{}-cloned-{}", config.base_template, state.members.len() + 1);
    let snapshot_name = format!("snap-{}", snapshot_timestamp());

    let result: Result<(), String> = async {
        run_step(
            executor,
            &["pct", "snapshot", &config.base_template, &snapshot_name],
            DEFAULT_TIMEOUT,
        )
        .await
        .map_err(|e| format!("snapshot: {e}"))?;

        let new_id_str = new_id.to_string();
        run_step(
            executor,
            &[
                "pct", "clone", &config.base_template, &new_id_str, "--snapname", &snapshot_name,
                "--hostname", &hostname,
            ],
            CLONE_TIMEOUT,
        )
        .await
        .map_err(|e| format!("clone: {e}"))?;

        configure_network(executor, config, &new_id_str, state).await?;

        run_step(executor, &["pct", "start", &new_id_str], DEFAULT_TIMEOUT)
            .await
            .map_err(|e| format!("start: {e}"))?;

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            state.members.push(new_id.to_string());
            state.last_action = Some(Instant::now());
            let _ = event_log.record(
                group_name,
                Action::ScaleOut,
                Some(new_id as f64),
                format!("cloned {} as {new_id} ({hostname})", config.base_template),
            );
            notifier.notify(
                "scale-out",
                &format!("group {group_name}: cloned {} as {new_id} ({hostname})", config.base_template),
                5,
            );
        }
        Err(detail) => {
            let _ = event_log.record(group_name, Action::Error, None, detail.clone());
            notifier.notify("scale-out failed", &format!("group {group_name}: {detail}"), 2);
        }
    }
}

async fn configure_network(
    executor: &dyn HostExecutor,
    config: &HorizontalGroupConfig,
    new_id: &str,
    state: &GroupState,
) -> Result<(), String> {
    match config.clone_network_mode {
        CloneNetworkMode::Dynamic => {
            run_step(
                executor,
                &["pct", "set", new_id, "-net0", "name=eth0,ip=dhcp"],
                DEFAULT_TIMEOUT,
            )
            .await
            .map_err(|e| format!("network config: {e}"))?;
        }
        CloneNetworkMode::Static => {
            let used: std::collections::HashSet<&str> =
                state.members.iter().map(String::as_str).collect();
            let address = config
                .static_ip_pool
                .iter()
                .find(|addr| !used.contains(addr.as_str()))
                .ok_or_else(|| "static ip pool exhausted".to_string())?;
            let net_arg = format!("name=eth0,ip={address}/24");
            run_step(executor, &["pct", "set", new_id, "-net0", &net_arg], DEFAULT_TIMEOUT)
                .await
                .map_err(|e| format!("network config: {e}"))?;
        }
    }
    Ok(())
}

async fn scale_in(
    executor: &dyn HostExecutor,
    event_log: &EventLog,
    notifier: &dyn Notifier,
    group_name: &str,
    config: &HorizontalGroupConfig,
    state: &mut GroupState,
) {
    let Some(victim) = state
        .members
        .iter()
        .filter_map(|id| id.parse::<u64>().ok().map(|n| (n, id.clone())))
        .max_by_key(|(n, _)| *n)
        .map(|(_, id)| id)
    else {
        return;
    };
    if victim == config.base_template {
        return;
    }

    let result = async {
        run_step(executor, &["pct", "stop", &victim], DEFAULT_TIMEOUT)
            .await
            .map_err(|e| format!("stop: {e}"))?;
        run_step(executor, &["pct", "destroy", &victim], DEFAULT_TIMEOUT)
            .await
            .map_err(|e| format!("destroy: {e}"))?;
        Ok::<(), String>(())
    }
    .await;

    match result {
        Ok(()) => {
            state.members.retain(|id| id != &victim);
            state.last_action = Some(Instant::now());
            let _ = event_log.record(group_name, Action::ScaleIn, None, format!("removed {victim}"));
            notifier.notify("scale-in", &format!("group {group_name}: removed {victim}"), 5);
        }
        Err(detail) => {
            let _ = event_log.record(group_name, Action::Error, None, detail.clone());
            notifier.notify("scale-in failed", &format!("group {group_name}: {detail}"), 2);
        }
    }
}

/// `YYYYMMDDHHMMSS`, matching `original_source/lxc_autoscale/lxc_utils.py::generate_unique_snapshot_name`'s
/// `strftime('%Y%m%d%H%M%S')`, so a retried scale-out after a transient
/// failure never reissues a snapshot name `pct` has already seen.
fn snapshot_timestamp() -> String {
    let format = time::macros::format_description!("[year][month][day][hour][minute][second]");
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "unknown-time".to_string())
}

async fn run_step(
    executor: &dyn HostExecutor,
    argv: &[&str],
    timeout: Duration,
) -> Result<String, crate::error::ExecError> {
    let owned: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    executor.run(&owned, timeout).await
}
