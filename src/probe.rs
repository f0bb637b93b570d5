// SPDX-License-Identifier: Apache-2.0

//! The Container Probe (spec.md §4.2): reads one container's current
//! limits and live utilization without mutating anything, and fans the
//! read out across all non-ignored containers under bounded concurrency
//! (spec.md §5, SPEC_FULL §5).

use crate::executor::{HostExecutor, DEFAULT_TIMEOUT};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// One container's state as of this tick (spec.md §3 "Container sample").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerSample {
    pub cores: u32,
    pub memory_mib: u64,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    /// Present only when the tier enables the supplemental disk-scaling
    /// pass (SPEC_FULL §3) and the read succeeded this tick.
    pub disk_pct: Option<f64>,
}

pub enum ProbeOutcome {
    Sample(ContainerSample),
    Skipped,
}

/// Reads liveness, configuration and utilization for one container. Never
/// issues a mutating command.
pub async fn probe_one(
    executor: &dyn HostExecutor,
    container_id: &str,
    disk_scaling_enabled: bool,
) -> ProbeOutcome {
    if !is_running(executor, container_id).await {
        return ProbeOutcome::Skipped;
    }

    let (cores, memory_mib) = match read_config(executor, container_id).await {
        Some(cfg) => cfg,
        None => {
            warn!("container {container_id}: failed to read current configuration, skipping");
            return ProbeOutcome::Skipped;
        }
    };

    let cpu_pct = cpu_usage(executor, container_id, cores).await;
    let mem_pct = memory_usage(executor, container_id).await;
    let disk_pct = if disk_scaling_enabled {
        disk_usage(executor, container_id).await
    } else {
        None
    };

    ProbeOutcome::Sample(ContainerSample {
        cores,
        memory_mib,
        cpu_pct,
        mem_pct,
        disk_pct,
    })
}

async fn is_running(executor: &dyn HostExecutor, container_id: &str) -> bool {
    let argv = vec!["pct".to_string(), "status".to_string(), container_id.to_string()];
    match executor.run(&argv, DEFAULT_TIMEOUT).await {
        Ok(out) => out.to_lowercase().contains("status: running"),
        Err(e) => {
            warn!("container {container_id}: status query failed: {e}");
            false
        }
    }
}

async fn read_config(executor: &dyn HostExecutor, container_id: &str) -> Option<(u32, u64)> {
    let argv = vec!["pct".to_string(), "config".to_string(), container_id.to_string()];
    let out = executor.run(&argv, DEFAULT_TIMEOUT).await.ok()?;
    parse_config(&out)
}

fn parse_config(text: &str) -> Option<(u32, u64)> {
    let mut cores = None;
    let mut memory_mib = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key == "cores" {
            cores = value.parse().ok();
        } else if key == "memory" {
            memory_mib = value.parse().ok();
        }
    }
    Some((cores?, memory_mib?))
}

/// CPU usage via the two fallback methods, tried in the order spec.md §4.2
/// names: loadavg-based first, then a one-second /proc/stat delta sample.
async fn cpu_usage(executor: &dyn HostExecutor, container_id: &str, cores: u32) -> f64 {
    if let Some(pct) = cpu_usage_loadavg(executor, container_id, cores).await {
        return pct;
    }
    if let Some(pct) = cpu_usage_proc_stat_delta(executor, container_id).await {
        return pct;
    }
    warn!("container {container_id}: both cpu usage methods failed, reporting 0.0");
    0.0
}

async fn cpu_usage_loadavg(executor: &dyn HostExecutor, container_id: &str, cores: u32) -> Option<f64> {
    if cores == 0 {
        return None;
    }
    let argv = vec![
        "pct".to_string(),
        "exec".to_string(),
        container_id.to_string(),
        "--".to_string(),
        "cat".to_string(),
        "/proc/loadavg".to_string(),
    ];
    let out = executor.run(&argv, DEFAULT_TIMEOUT).await.ok()?;
    let load1: f64 = out.split_whitespace().next()?.parse().ok()?;
    Some((load1 / f64::from(cores) * 100.0).clamp(0.0, 100.0))
}

async fn cpu_usage_proc_stat_delta(executor: &dyn HostExecutor, container_id: &str) -> Option<f64> {
    let (idle1, total1) = read_proc_stat(executor, container_id).await?;
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let (idle2, total2) = read_proc_stat(executor, container_id).await?;

    let delta_idle = idle2.checked_sub(idle1)?;
    let delta_total = total2.checked_sub(total1)?;
    if delta_total == 0 {
        return None;
    }
    let usage = 100.0 * (1.0 - (delta_idle as f64 / delta_total as f64));
    Some(usage.clamp(0.0, 100.0))
}

async fn read_proc_stat(executor: &dyn HostExecutor, container_id: &str) -> Option<(u64, u64)> {
    let argv = vec![
        "pct".to_string(),
        "exec".to_string(),
        container_id.to_string(),
        "--".to_string(),
        "cat".to_string(),
        "/proc/stat".to_string(),
    ];
    let out = executor.run(&argv, DEFAULT_TIMEOUT).await.ok()?;
    let cpu_line = out.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3];
    let total: u64 = fields.iter().sum();
    Some((idle, total))
}

async fn memory_usage(executor: &dyn HostExecutor, container_id: &str) -> f64 {
    let argv = vec![
        "pct".to_string(),
        "exec".to_string(),
        container_id.to_string(),
        "--".to_string(),
        "cat".to_string(),
        "/proc/meminfo".to_string(),
    ];
    let Ok(out) = executor.run(&argv, DEFAULT_TIMEOUT).await else {
        warn!("container {container_id}: memory usage read failed, reporting 0.0");
        return 0.0;
    };
    parse_meminfo(&out).unwrap_or_else(|| {
        warn!("container {container_id}: could not parse /proc/meminfo, reporting 0.0");
        0.0
    })
}

fn parse_meminfo(text: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value_kib: f64 = rest
            .trim()
            .split_whitespace()
            .next()?
            .parse()
            .ok()?;
        match key.trim() {
            "MemTotal" => total = Some(value_kib),
            "MemAvailable" => available = Some(value_kib),
            _ => {}
        }
    }
    let total = total?;
    if total == 0.0 {
        return None;
    }
    let available = available?;
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

/// Supplemental (SPEC_FULL §3): root filesystem usage, read the same way
/// `original_source/usr/local/bin/lxc_autoscale.py` derives storage
/// pressure, via a `df`-equivalent report instead of a dedicated API.
async fn disk_usage(executor: &dyn HostExecutor, container_id: &str) -> Option<f64> {
    let argv = vec![
        "pct".to_string(),
        "exec".to_string(),
        container_id.to_string(),
        "--".to_string(),
        "df".to_string(),
        "--output=pcent".to_string(),
        "/".to_string(),
    ];
    let out = executor.run(&argv, DEFAULT_TIMEOUT).await.ok()?;
    let pct_str = out.lines().nth(1)?.trim().trim_end_matches('%');
    pct_str.parse().ok()
}

/// Probes every non-ignored container concurrently, bounded by `workers`
/// in-flight probes at a time (spec.md §5, "typically 8 workers").
pub async fn probe_all(
    executor: Arc<dyn HostExecutor>,
    container_ids: Vec<String>,
    disk_scaling_by_container: HashMap<String, bool>,
    workers: usize,
) -> HashMap<String, ContainerSample> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks: JoinSet<(String, ProbeOutcome)> = JoinSet::new();

    for container_id in container_ids {
        let executor = Arc::clone(&executor);
        let semaphore = Arc::clone(&semaphore);
        let disk_scaling = disk_scaling_by_container
            .get(&container_id)
            .copied()
            .unwrap_or(false);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let outcome = probe_one(executor.as_ref(), &container_id, disk_scaling).await;
            (container_id, outcome)
        });
    }

    let mut samples = HashMap::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((container_id, ProbeOutcome::Sample(sample))) => {
                samples.insert(container_id, sample);
            }
            Ok((_, ProbeOutcome::Skipped)) => {}
            Err(e) => warn!("probe task panicked: {e}"),
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_extracts_cores_and_memory() {
        let text = "arch: amd64\ncores: 4\nmemory: 2048\nhostname: web1\n";
        assert_eq!(parse_config(text), Some((4, 2048)));
    }

    #[test]
    fn test_parse_config_missing_field_returns_none() {
        let text = "arch: amd64\ncores: 4\n";
        assert_eq!(parse_config(text), None);
    }

    #[test]
    fn test_parse_meminfo_computes_used_percent() {
        let text = "MemTotal:       1000000 kB\nMemAvailable:    250000 kB\n";
        let pct = parse_meminfo(text).unwrap();
        assert!((pct - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo_missing_fields_returns_none() {
        assert_eq!(parse_meminfo("Foo: 1 kB\n"), None);
    }
}
