// SPDX-License-Identifier: Apache-2.0

//! The Vertical Scaler (spec.md §4.7): for each container, computes and
//! applies a CPU-core and/or memory delta within tier and host-pool
//! limits, processed serially in descending-utilization order so the Host
//! Accountant never needs synchronization.

use crate::accountant::HostAccountant;
use crate::config::Behaviour;
use crate::event_log::{Action, EventLog};
use crate::executor::{HostExecutor, DEFAULT_TIMEOUT};
use crate::notifier::Notifier;
use crate::probe::ContainerSample;
use crate::resolver::TierResolver;
use crate::state_store::{BackupRecord, StateStore};
use crate::tier::TierConfig;
use log::warn;
use std::collections::HashMap;

/// Fixed system constants named in spec.md §4.7.
const CPU_SCALE_DIVISOR: f64 = 10.0;
const MEMORY_SCALE_FACTOR: f64 = 10.0;

pub struct VerticalScalerInputs<'a> {
    pub executor: &'a dyn HostExecutor,
    pub state_store: &'a StateStore,
    pub event_log: &'a EventLog,
    pub resolver: &'a TierResolver,
    pub notifier: &'a dyn Notifier,
    pub ignore: &'a [String],
    pub behaviour: Behaviour,
    pub energy_mode: bool,
    pub off_peak_start: u32,
    pub off_peak_end: u32,
    pub current_hour: u32,
}

pub fn is_off_peak(start: u32, end: u32, hour: u32) -> bool {
    if start < end {
        start <= hour && hour < end
    } else {
        hour >= start || hour < end
    }
}

fn behaviour_multiplier(behaviour: Behaviour, off_peak: bool) -> f64 {
    let base = behaviour.multiplier();
    if off_peak {
        base * 0.8
    } else {
        base
    }
}

/// Containers are processed in descending `(cpu_pct, mem_pct)` order, id
/// ascending as the final tie-break, so hot containers claim the finite
/// pool first and the outcome never depends on probe completion order
/// (spec.md §8 "Determinism of priority").
fn priority_order(samples: &HashMap<String, ContainerSample>) -> Vec<String> {
    let mut ids: Vec<String> = samples.keys().cloned().collect();
    ids.sort_by(|a, b| {
        let sa = &samples[a];
        let sb = &samples[b];
        sb.cpu_pct
            .partial_cmp(&sa.cpu_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| sb.mem_pct.partial_cmp(&sa.mem_pct).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.cmp(b))
    });
    ids
}

/// Runs the decision algorithm for every sampled container, in priority
/// order, against one shared tick-scoped accountant (spec.md §5: serial
/// within a tick so the accountant never needs synchronization).
pub async fn run(
    inputs: &VerticalScalerInputs<'_>,
    samples: &HashMap<String, ContainerSample>,
    accountant: &mut HostAccountant,
) {
    let off_peak = inputs.energy_mode
        && is_off_peak(inputs.off_peak_start, inputs.off_peak_end, inputs.current_hour);

    for container_id in priority_order(samples) {
        if inputs.ignore.contains(&container_id) {
            continue;
        }
        let sample = samples[&container_id];

        // Backed up as soon as the container is probed (spec.md §3: "created
        // on first probe; overwritten each tick the container appears"),
        // independent of whether its tier later validates — a container
        // stuck with a bad tier must still get a fresh restore point.
        if let Err(e) = inputs
            .state_store
            .save(&container_id, BackupRecord { cores: sample.cores, memory_mib: sample.memory_mib })
        {
            warn!("container {container_id}: backup save failed: {e}");
        }

        let tier = match inputs.resolver.resolve(&container_id) {
            Ok(tier) => tier,
            Err(e) => {
                warn!("container {container_id}: invalid tier, skipping: {e}");
                let _ = inputs.event_log.record(
                    &container_id,
                    Action::Error,
                    None,
                    format!("invalid tier: {e}"),
                );
                inputs.notifier.notify(
                    "invalid tier",
                    &format!("container {container_id}: {e}"),
                    3,
                );
                continue;
            }
        };

        let mult = behaviour_multiplier(inputs.behaviour, off_peak);
        apply_one(inputs, &container_id, sample, &tier, mult, off_peak, accountant).await;
    }
}

/// Applies the CPU, memory, and off-peak clamp decisions for one
/// container against the shared, tick-scoped accountant.
async fn apply_one(
    inputs: &VerticalScalerInputs<'_>,
    container_id: &str,
    sample: ContainerSample,
    tier: &TierConfig,
    mult: f64,
    off_peak: bool,
    accountant: &mut HostAccountant,
) {
    let mut cores = sample.cores;
    let mut memory_mib = sample.memory_mib;

    // CPU decision: increase and decrease are mutually exclusive.
    if sample.cpu_pct > tier.cpu_upper && cores < tier.max_cores {
        let prop = ((sample.cpu_pct - tier.cpu_upper) / CPU_SCALE_DIVISOR).floor();
        let lower_bound = (f64::from(tier.core_min_increment) * mult).round();
        let upper_bound = (f64::from(tier.core_max_increment) * mult).round();
        let mut inc = prop.clamp(lower_bound.min(upper_bound), lower_bound.max(upper_bound)) as u32;
        inc = inc.min(tier.max_cores - cores);
        if inc > 0 && accountant.try_allocate_cores(inc) {
            if apply_command(inputs, container_id, &["set", "-cores"], inc.to_string()).await {
                cores += inc;
                let _ = inputs.event_log.record(
                    container_id,
                    Action::IncreaseCores,
                    Some(f64::from(inc)),
                    format!("cpu_pct={:.1}", sample.cpu_pct),
                );
            } else {
                accountant.release_cores(inc);
                let _ = inputs.event_log.record(
                    container_id,
                    Action::Error,
                    None,
                    "increase-cores command failed".to_string(),
                );
                inputs.notifier.notify(
                    "scale-up failed",
                    &format!("container {container_id}: increase-cores command failed"),
                    2,
                );
            }
        }
    } else if sample.cpu_pct < tier.cpu_lower && cores > tier.min_cores {
        let dyn_amount = ((tier.cpu_lower - sample.cpu_pct) / CPU_SCALE_DIVISOR).floor().max(1.0);
        let headroom = cores - tier.min_cores;
        let dec = (dyn_amount.clamp(f64::from(tier.core_min_increment), f64::from(headroom)) * mult)
            .round()
            .clamp(0.0, f64::from(headroom)) as u32;
        if dec > 0 {
            if apply_command(inputs, container_id, &["set", "-cores"], (cores - dec).to_string()).await {
                accountant.release_cores(dec);
                cores -= dec;
                let _ = inputs.event_log.record(
                    container_id,
                    Action::DecreaseCores,
                    Some(-f64::from(dec)),
                    format!("cpu_pct={:.1}", sample.cpu_pct),
                );
            } else {
                let _ = inputs.event_log.record(
                    container_id,
                    Action::Error,
                    None,
                    "decrease-cores command failed".to_string(),
                );
            }
        }
    }

    // Memory decision: independent of the CPU outcome, applied after.
    if sample.mem_pct > tier.mem_upper {
        let prop = ((sample.mem_pct - tier.mem_upper) * tier.memory_min_increment as f64 / MEMORY_SCALE_FACTOR).ceil();
        let inc = (tier.memory_min_increment as f64 * mult).max(prop) as u64;
        if inc > 0 && accountant.try_allocate_memory(inc) {
            if apply_command(inputs, container_id, &["set", "-memory"], (memory_mib + inc).to_string()).await {
                memory_mib += inc;
                let _ = inputs.event_log.record(
                    container_id,
                    Action::IncreaseMemory,
                    Some(inc as f64),
                    format!("mem_pct={:.1}", sample.mem_pct),
                );
            } else {
                accountant.release_memory(inc);
                let _ = inputs.event_log.record(
                    container_id,
                    Action::Error,
                    None,
                    "increase-memory command failed".to_string(),
                );
                inputs.notifier.notify(
                    "scale-up failed",
                    &format!("container {container_id}: increase-memory command failed"),
                    2,
                );
            }
        }
    } else if sample.mem_pct < tier.mem_lower && memory_mib > tier.min_memory {
        let chunk = (tier.min_decrease_chunk as f64 * mult).max(1.0);
        let headroom = (memory_mib - tier.min_memory) as f64;
        let dec = (chunk * (headroom / chunk).floor()).min(headroom) as u64;
        if dec > 0 {
            if apply_command(inputs, container_id, &["set", "-memory"], (memory_mib - dec).to_string()).await {
                accountant.release_memory(dec);
                memory_mib -= dec;
                let _ = inputs.event_log.record(
                    container_id,
                    Action::DecreaseMemory,
                    Some(-(dec as f64)),
                    format!("mem_pct={:.1}", sample.mem_pct),
                );
            } else {
                let _ = inputs.event_log.record(
                    container_id,
                    Action::Error,
                    None,
                    "decrease-memory command failed".to_string(),
                );
            }
        }
    }

    // Supplemental disk-resize pass (SPEC_FULL §4.7): same proportional-chunk
    // shape as the memory path, against `disk_pct` instead of `mem_pct`.
    // Never touches the Host Accountant — root filesystem space isn't part
    // of the host core/memory pool.
    if let (Some(disk_pct), Some(upper), Some(storage_inc)) =
        (sample.disk_pct, tier.disk_upper_pct, tier.storage_min_increment_mib)
    {
        if disk_pct > upper {
            let prop = ((disk_pct - upper) * storage_inc as f64 / MEMORY_SCALE_FACTOR).ceil();
            let inc = (storage_inc as f64 * mult).max(prop) as u64;
            if inc > 0 {
                if apply_command(inputs, container_id, &["resize", "rootfs"], format!("+{inc}M")).await {
                    let _ = inputs.event_log.record(
                        container_id,
                        Action::IncreaseStorage,
                        Some(inc as f64),
                        format!("disk_pct={disk_pct:.1}"),
                    );
                } else {
                    let _ = inputs.event_log.record(
                        container_id,
                        Action::Error,
                        None,
                        "increase-storage command failed".to_string(),
                    );
                }
            }
        } else if let Some(lower) = tier.disk_lower_pct {
            if disk_pct < lower {
                let dec = (storage_inc as f64 * mult).round() as u64;
                if dec > 0 {
                    if apply_command(inputs, container_id, &["resize", "rootfs"], format!("-{dec}M")).await {
                        let _ = inputs.event_log.record(
                            container_id,
                            Action::DecreaseStorage,
                            Some(-(dec as f64)),
                            format!("disk_pct={disk_pct:.1}"),
                        );
                    } else {
                        let _ = inputs.event_log.record(
                            container_id,
                            Action::Error,
                            None,
                            "decrease-storage command failed".to_string(),
                        );
                    }
                }
            }
        }
    }

    if off_peak {
        if cores > tier.min_cores {
            let diff = cores - tier.min_cores;
            if apply_command(inputs, container_id, &["set", "-cores"], tier.min_cores.to_string()).await {
                accountant.release_cores(diff);
                let _ = inputs.event_log.record(
                    container_id,
                    Action::OffPeakClampCores,
                    Some(-f64::from(diff)),
                    "off-peak clamp".to_string(),
                );
            }
        }
        if memory_mib > tier.min_memory {
            let diff = memory_mib - tier.min_memory;
            if apply_command(inputs, container_id, &["set", "-memory"], tier.min_memory.to_string()).await {
                accountant.release_memory(diff);
                let _ = inputs.event_log.record(
                    container_id,
                    Action::OffPeakClampMemory,
                    Some(-(diff as f64)),
                    "off-peak clamp".to_string(),
                );
            }
        }
    }
}

async fn apply_command(
    inputs: &VerticalScalerInputs<'_>,
    container_id: &str,
    set_flag: &[&str],
    value: String,
) -> bool {
    let mut argv = vec!["pct".to_string(), set_flag[0].to_string(), container_id.to_string()];
    argv.push(set_flag[1].to_string());
    argv.push(value);
    match inputs.executor.run(&argv, DEFAULT_TIMEOUT).await {
        Ok(_) => true,
        Err(e) => {
            warn!("container {container_id}: apply command failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_off_peak_window_non_wrapping() {
        assert!(is_off_peak(8, 18, 10));
        assert!(!is_off_peak(8, 18, 20));
    }

    #[test]
    fn test_off_peak_window_wrapping_midnight() {
        assert!(is_off_peak(22, 6, 2));
        assert!(is_off_peak(22, 6, 23));
        assert!(!is_off_peak(22, 6, 12));
    }

    #[test]
    fn test_behaviour_multiplier_applies_off_peak_discount() {
        assert_eq!(behaviour_multiplier(Behaviour::Normal, false), 1.0);
        assert!((behaviour_multiplier(Behaviour::Normal, true) - 0.8).abs() < 1e-9);
        assert!((behaviour_multiplier(Behaviour::Aggressive, true) - 1.6).abs() < 1e-9);
    }

    fn sample(cpu: f64, mem: f64) -> ContainerSample {
        ContainerSample { cores: 2, memory_mib: 1024, cpu_pct: cpu, mem_pct: mem, disk_pct: None }
    }

    #[test]
    fn test_priority_order_sorts_by_cpu_then_mem_then_id() {
        let mut samples = HashMap::new();
        samples.insert("b".to_string(), sample(50.0, 90.0));
        samples.insert("a".to_string(), sample(90.0, 10.0));
        samples.insert("c".to_string(), sample(90.0, 10.0));
        let order = priority_order(&samples);
        assert_eq!(order, vec!["a".to_string(), "c".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_scenario_one_cpu_increase() {
        // spec.md §8 scenario 1: cpu_upper=80, cpu_lower=20, min_cores=1,
        // max_cores=8, core_min_inc=1, core_max_inc=4; cores=2, cpu_pct=95.
        let prop = ((95.0f64 - 80.0) / CPU_SCALE_DIVISOR).floor();
        assert_eq!(prop, 1.0);
        let lower = 1.0_f64;
        let upper = 4.0_f64;
        let inc = prop.clamp(lower, upper) as u32;
        assert_eq!(inc, 1);
    }

    #[test]
    fn test_scenario_two_cpu_decrease() {
        // scenario 2: cores=4, cpu_pct=5, cpu_lower=20.
        let dyn_amount = ((20.0f64 - 5.0) / CPU_SCALE_DIVISOR).floor().max(1.0);
        assert_eq!(dyn_amount, 1.0);
    }
}
