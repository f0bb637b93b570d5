// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use thiserror::Error;

/// Failure surfaced by a [`crate::executor::HostExecutor`] call.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Failure validating a single container's [`crate::tier::TierConfig`].
#[derive(Error, Debug, Clone)]
pub enum TierError {
    #[error("cpu_lower ({lower}) must be less than cpu_upper ({upper})")]
    CpuThresholdOrder { lower: f64, upper: f64 },
    #[error("mem_lower ({lower}) must be less than mem_upper ({upper})")]
    MemThresholdOrder { lower: f64, upper: f64 },
    #[error("cpu_upper/cpu_lower must be within [0, 100], got {value}")]
    CpuOutOfRange { value: f64 },
    #[error("mem_upper/mem_lower must be within [0, 100], got {value}")]
    MemOutOfRange { value: f64 },
    #[error("min_cores ({min}) must be <= max_cores ({max}) and >= 1")]
    CoreBounds { min: u32, max: u32 },
    #[error("min_memory ({0} MiB) must be >= 128 MiB")]
    MinMemoryTooSmall(u64),
    #[error("core_min_increment ({min}) must be <= core_max_increment ({max})")]
    CoreIncrementOrder { min: u32, max: u32 },
    #[error("{field} must be >= 1, got {value}")]
    IncrementTooSmall { field: &'static str, value: u64 },
}

/// Failure loading or validating the configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid tier {tier}: {source}")]
    InvalidTier {
        tier: String,
        #[source]
        source: TierError,
    },
    #[error("reserve_cpu_percent must be in [0, 100], got {0}")]
    InvalidReservePercent(u32),
    #[error("off_peak_start/off_peak_end must be hours in [0, 23], got start={start}, end={end}")]
    InvalidOffPeakWindow { start: u32, end: u32 },
    #[error("horizontal group {group}: min_instances ({min}) must be <= max_instances ({max})")]
    InvalidGroupBounds { group: String, min: u32, max: u32 },
}
