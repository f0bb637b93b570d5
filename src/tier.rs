// SPDX-License-Identifier: Apache-2.0

//! The per-container threshold bundle (spec.md §3 `TierConfig`) and its
//! validation, shared by named tiers and the fallback tier in `config.rs`.

use crate::error::TierError;
use serde::Deserialize;

/// Thresholds and increment sizing for one tier. Every numeric field here
/// is a direct counterpart of a key in `original_source/lxc_autoscale/config.py`'s
/// `DEFAULTS` dict, renamed to match the data model in spec.md §3.
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub cpu_upper: f64,
    pub cpu_lower: f64,
    pub mem_upper: f64,
    pub mem_lower: f64,
    pub min_cores: u32,
    pub max_cores: u32,
    pub min_memory: u64,
    pub core_min_increment: u32,
    pub core_max_increment: u32,
    pub memory_min_increment: u64,
    pub min_decrease_chunk: u64,
    pub tier_label: String,

    // Supplemental disk-scaling fields (SPEC_FULL §3). Absent unless the
    // tier opts in; the resolver never synthesizes a default for these.
    #[serde(default)]
    pub disk_upper_pct: Option<f64>,
    #[serde(default)]
    pub disk_lower_pct: Option<f64>,
    #[serde(default)]
    pub storage_min_increment_mib: Option<u64>,
    #[serde(default)]
    pub min_storage_mib: Option<u64>,
}

impl TierConfig {
    /// Checks the invariants spec.md §4.5 requires before a tier can be
    /// handed to the Vertical Scaler. Validation failure is fail-closed at
    /// the container level (Design Notes §9), never startup-fatal.
    pub fn validate(&self) -> Result<(), TierError> {
        for value in [self.cpu_upper, self.cpu_lower] {
            if !(0.0..=100.0).contains(&value) {
                return Err(TierError::CpuOutOfRange { value });
            }
        }
        for value in [self.mem_upper, self.mem_lower] {
            if !(0.0..=100.0).contains(&value) {
                return Err(TierError::MemOutOfRange { value });
            }
        }
        if self.cpu_lower >= self.cpu_upper {
            return Err(TierError::CpuThresholdOrder {
                lower: self.cpu_lower,
                upper: self.cpu_upper,
            });
        }
        if self.mem_lower >= self.mem_upper {
            return Err(TierError::MemThresholdOrder {
                lower: self.mem_lower,
                upper: self.mem_upper,
            });
        }
        if self.min_cores < 1 || self.min_cores > self.max_cores {
            return Err(TierError::CoreBounds {
                min: self.min_cores,
                max: self.max_cores,
            });
        }
        if self.min_memory < 128 {
            return Err(TierError::MinMemoryTooSmall(self.min_memory));
        }
        if self.core_min_increment > self.core_max_increment {
            return Err(TierError::CoreIncrementOrder {
                min: self.core_min_increment,
                max: self.core_max_increment,
            });
        }
        if self.core_min_increment < 1 {
            return Err(TierError::IncrementTooSmall {
                field: "core_min_increment",
                value: self.core_min_increment as u64,
            });
        }
        if self.core_max_increment < 1 {
            return Err(TierError::IncrementTooSmall {
                field: "core_max_increment",
                value: self.core_max_increment as u64,
            });
        }
        if self.memory_min_increment < 1 {
            return Err(TierError::IncrementTooSmall {
                field: "memory_min_increment",
                value: self.memory_min_increment,
            });
        }
        if self.min_decrease_chunk < 1 {
            return Err(TierError::IncrementTooSmall {
                field: "min_decrease_chunk",
                value: self.min_decrease_chunk,
            });
        }
        Ok(())
    }

    pub fn disk_scaling_enabled(&self) -> bool {
        self.disk_upper_pct.is_some() && self.storage_min_increment_mib.is_some()
    }
}
