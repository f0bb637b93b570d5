// SPDX-License-Identifier: Apache-2.0

//! The Control Loop (spec.md §4.9): orchestrates one scheduling tick
//! end-to-end — probe, decide, apply, sleep — and owns the singleton lock
//! and signal handling. Two ticks never overlap (spec.md §5).

use crate::accountant::HostAccountant;
use crate::config::{Behaviour, HorizontalGroupConfig, ResolvedConfig};
use crate::event_log::EventLog;
use crate::executor::{HostExecutor, DEFAULT_TIMEOUT};
use crate::horizontal::{self, GroupState};
use crate::notifier::{LogNotifier, Notifier};
use crate::probe;
use crate::resolver::TierResolver;
use crate::state_store::StateStore;
use crate::vertical::{self, VerticalScalerInputs};
use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

pub struct ControlLoop {
    executor: Arc<dyn HostExecutor>,
    state_store: StateStore,
    event_log: EventLog,
    resolver: TierResolver,
    notifier: Arc<dyn Notifier>,
    horizontal_groups: Vec<(String, HorizontalGroupConfig)>,
    ignore: Vec<String>,
    behaviour: Behaviour,
    energy_mode: bool,
    off_peak_start: u32,
    off_peak_end: u32,
    reserve_cpu_percent: u32,
    reserve_memory_mib: u64,
    poll_interval: Duration,
    probe_workers: usize,
    host: String,
}

impl ControlLoop {
    pub fn new(
        executor: Arc<dyn HostExecutor>,
        config: &ResolvedConfig,
        host: String,
        poll_interval_override: Option<Duration>,
        energy_mode_override: bool,
    ) -> Self {
        let resolver = TierResolver::new(
            config.tier_by_container.clone(),
            config.defaults.fallback_tier.clone(),
        );
        Self {
            executor,
            state_store: StateStore::new(config.defaults.backup_dir.clone()),
            event_log: EventLog::open(&config.defaults.event_log_path, &host)
                .expect("event log path must be writable"),
            resolver,
            notifier: Arc::new(LogNotifier),
            horizontal_groups: config.horizontal_groups.clone(),
            ignore: config.defaults.ignore.clone(),
            behaviour: config.defaults.behaviour,
            energy_mode: energy_mode_override || config.defaults.energy_mode,
            off_peak_start: config.defaults.off_peak_start,
            off_peak_end: config.defaults.off_peak_end,
            reserve_cpu_percent: config.defaults.reserve_cpu_percent,
            reserve_memory_mib: config.defaults.reserve_memory_mib,
            poll_interval: poll_interval_override
                .unwrap_or(Duration::from_secs(config.defaults.poll_interval)),
            probe_workers: config.defaults.probe_workers,
            host,
        }
    }

    pub async fn run_forever(&self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(signal_watcher(shutdown_tx));

        let mut group_states: HashMap<String, GroupState> = self
            .horizontal_groups
            .iter()
            .map(|(name, cfg)| (name.clone(), GroupState::new(cfg.members.clone())))
            .collect();

        loop {
            if *shutdown_rx.borrow() {
                info!("shutdown flag set, exiting control loop");
                return Ok(());
            }

            let tick_start = Instant::now();
            if let Err(e) = self.run_tick(&mut group_states).await {
                warn!("tick failed: {e:#}");
            }
            let elapsed = tick_start.elapsed();

            if elapsed >= self.poll_interval {
                warn!(
                    "tick took {:?}, exceeding poll_interval {:?}; starting next tick immediately",
                    elapsed, self.poll_interval
                );
                continue;
            }
            let remaining = self.poll_interval - elapsed;

            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = shutdown_rx.changed() => {
                    info!("shutdown requested during sleep, exiting after this tick");
                    return Ok(());
                }
            }
        }
    }

    async fn run_tick(&self, group_states: &mut HashMap<String, GroupState>) -> Result<()> {
        let container_ids = self.list_container_ids().await?;
        let non_ignored: Vec<String> = container_ids
            .into_iter()
            .filter(|id| !self.ignore.contains(id))
            .collect();

        let disk_scaling_by_container: HashMap<String, bool> = non_ignored
            .iter()
            .map(|id| {
                let enabled = self
                    .resolver
                    .resolve(id)
                    .map(|t| t.disk_scaling_enabled())
                    .unwrap_or(false);
                (id.clone(), enabled)
            })
            .collect();

        let samples = probe::probe_all(
            Arc::clone(&self.executor),
            non_ignored,
            disk_scaling_by_container,
            self.probe_workers,
        )
        .await;

        let (total_cores, total_memory_mib) = self.read_host_totals().await?;
        let mut accountant = HostAccountant::new(
            total_cores,
            total_memory_mib,
            self.reserve_cpu_percent,
            self.reserve_memory_mib,
        );

        let current_hour = current_local_hour();
        let inputs = VerticalScalerInputs {
            executor: self.executor.as_ref(),
            state_store: &self.state_store,
            event_log: &self.event_log,
            resolver: &self.resolver,
            notifier: self.notifier.as_ref(),
            ignore: &self.ignore,
            behaviour: self.behaviour,
            energy_mode: self.energy_mode,
            off_peak_start: self.off_peak_start,
            off_peak_end: self.off_peak_end,
            current_hour,
        };
        vertical::run(&inputs, &samples, &mut accountant).await;

        for (name, config) in &self.horizontal_groups {
            if let Some(state) = group_states.get_mut(name) {
                horizontal::run_group(
                    self.executor.as_ref(),
                    &self.event_log,
                    self.notifier.as_ref(),
                    name,
                    config,
                    state,
                    &samples,
                    &self.ignore,
                )
                .await;
            }
        }

        Ok(())
    }

    async fn list_container_ids(&self) -> Result<Vec<String>> {
        let argv = vec!["pct".to_string(), "list".to_string()];
        let out = self
            .executor
            .run(&argv, DEFAULT_TIMEOUT)
            .await
            .context("listing containers")?;
        Ok(out
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    async fn read_host_totals(&self) -> Result<(u32, u64)> {
        let nproc = self
            .executor
            .run(&["nproc".to_string()], DEFAULT_TIMEOUT)
            .await
            .context("reading host core count")?;
        let total_cores: u32 = nproc.trim().parse().context("parsing nproc output")?;

        let meminfo = self
            .executor
            .run(
                &["cat".to_string(), "/proc/meminfo".to_string()],
                DEFAULT_TIMEOUT,
            )
            .await
            .context("reading host memory total")?;
        let total_memory_mib = meminfo
            .lines()
            .find(|l| l.starts_with("MemTotal"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb / 1024)
            .context("parsing MemTotal from /proc/meminfo")?;

        Ok((total_cores, total_memory_mib))
    }
}

async fn signal_watcher(tx: watch::Sender<bool>) {
    let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
        return;
    };
    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        return;
    };
    let Ok(mut sighup) = signal(SignalKind::hangup()) else {
        return;
    };

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sighup.recv() => info!("received SIGHUP"),
    }
    let _ = tx.send(true);
}

fn current_local_hour() -> u32 {
    let now = time::OffsetDateTime::now_utc();
    let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    now.to_offset(offset).hour() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_local_hour_in_range() {
        assert!(current_local_hour() < 24);
    }
}
