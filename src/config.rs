// SPDX-License-Identifier: Apache-2.0

//! Loading and validation for the single declarative configuration document
//! described in spec.md §6: top-level defaults, zero or more tiers, zero or
//! more horizontal scaling groups, and an optional remote-execution block.

use crate::error::{ConfigError, TierError};
use crate::tier::TierConfig;
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hv-autoscale/config.yaml";

fn default_log_path() -> String {
    "/var/log/hv-autoscale/hv-autoscale.log".to_string()
}

fn default_lock_path() -> String {
    "/var/lock/hv-autoscale.lock".to_string()
}

fn default_backup_dir() -> String {
    "/var/lib/hv-autoscale/backups".to_string()
}

fn default_event_log_path() -> String {
    "/var/log/hv-autoscale/events.ndjson".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_reserve_cpu_percent() -> u32 {
    10
}

fn default_reserve_memory_mib() -> u64 {
    2048
}

fn default_off_peak_start() -> u32 {
    22
}

fn default_off_peak_end() -> u32 {
    6
}

fn default_probe_workers() -> usize {
    8
}

/// Behaviour mode: how aggressively scaling increments are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Behaviour {
    Conservative,
    #[default]
    Normal,
    Aggressive,
}

impl Behaviour {
    pub fn multiplier(self) -> f64 {
        match self {
            Behaviour::Conservative => 0.5,
            Behaviour::Normal => 1.0,
            Behaviour::Aggressive => 2.0,
        }
    }
}

/// `default` section: system-wide knobs and the fallback tier thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_log_path")]
    pub log_path: String,
    #[serde(default = "default_lock_path")]
    pub lock_path: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_event_log_path")]
    pub event_log_path: String,
    #[serde(default = "default_reserve_cpu_percent")]
    pub reserve_cpu_percent: u32,
    #[serde(default = "default_reserve_memory_mib")]
    pub reserve_memory_mib: u64,
    #[serde(default = "default_off_peak_start")]
    pub off_peak_start: u32,
    #[serde(default = "default_off_peak_end")]
    pub off_peak_end: u32,
    #[serde(default)]
    pub behaviour: Behaviour,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub energy_mode: bool,
    #[serde(default = "default_probe_workers")]
    pub probe_workers: usize,
    /// Thresholds applied to any container not covered by a named tier.
    #[serde(flatten)]
    pub fallback_tier: TierConfig,
}

/// One `tiers.<name>` section: a named bundle of thresholds shared by a set
/// of container ids.
#[derive(Debug, Clone, Deserialize)]
pub struct TierSection {
    pub containers: Vec<String>,
    #[serde(flatten)]
    pub tier: TierConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneNetworkMode {
    Dynamic,
    Static,
}

/// One `horizontal_groups.<name>` section (spec.md §3).
#[derive(Debug, Clone, Deserialize)]
pub struct HorizontalGroupConfig {
    pub members: Vec<String>,
    pub base_template: String,
    pub starting_clone_id: u64,
    pub max_members: u32,
    #[serde(default = "default_min_members")]
    pub min_members: u32,
    pub horiz_cpu_upper: f64,
    pub horiz_memory_upper: f64,
    pub horiz_cpu_lower: Option<f64>,
    pub horiz_memory_lower: Option<f64>,
    #[serde(default = "default_scale_grace")]
    pub scale_out_grace_secs: u64,
    #[serde(default = "default_scale_grace")]
    pub scale_in_grace_secs: u64,
    pub clone_network_mode: CloneNetworkMode,
    #[serde(default)]
    pub static_ip_pool: Vec<String>,
}

fn default_min_members() -> u32 {
    1
}

fn default_scale_grace() -> u64 {
    300
}

/// Optional remote-execution backend (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Raw shape of the YAML document before flattening into the resolved maps
/// the rest of the daemon consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDocument {
    #[serde(rename = "default")]
    pub defaults: Defaults,
    #[serde(default)]
    pub tiers: HashMap<String, TierSection>,
    #[serde(default)]
    pub horizontal_groups: HashMap<String, HorizontalGroupConfig>,
    pub remote: Option<RemoteConfig>,
}

/// The resolved configuration: every container id maps to a validated tier
/// (Design Notes §9 — the scaler never sees an "unknown" tier, only "valid"
/// or "invalid"), and horizontal groups are a flat list.
pub struct ResolvedConfig {
    pub defaults: Defaults,
    pub tier_by_container: HashMap<String, Result<TierConfig, TierError>>,
    pub horizontal_groups: Vec<(String, HorizontalGroupConfig)>,
    pub remote: Option<RemoteConfig>,
}

pub fn load(path: &Path) -> Result<ResolvedConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse(&contents, path)
}

fn parse(contents: &str, path: &Path) -> Result<ResolvedConfig, ConfigError> {
    let doc: RawDocument = serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    resolve(doc)
}

fn resolve(doc: RawDocument) -> Result<ResolvedConfig, ConfigError> {
    if doc.defaults.reserve_cpu_percent > 100 {
        return Err(ConfigError::InvalidReservePercent(
            doc.defaults.reserve_cpu_percent,
        ));
    }
    if doc.defaults.off_peak_start > 23 || doc.defaults.off_peak_end > 23 {
        return Err(ConfigError::InvalidOffPeakWindow {
            start: doc.defaults.off_peak_start,
            end: doc.defaults.off_peak_end,
        });
    }
    for (name, group) in &doc.horizontal_groups {
        if group.min_members > group.max_members {
            return Err(ConfigError::InvalidGroupBounds {
                group: name.clone(),
                min: group.min_members,
                max: group.max_members,
            });
        }
    }

    let mut tier_by_container = HashMap::new();
    for (tier_name, section) in &doc.tiers {
        let validated: Result<TierConfig, TierError> =
            section.tier.validate().map(|()| section.tier.clone());
        if let Err(e) = &validated {
            warn!("tier {tier_name} failed validation, containers fall back to no tier: {e}");
        }
        // A single invalid tier is fail-closed per container (spec.md §4.5),
        // not a startup-fatal configuration error, so we record the error
        // per container instead of propagating it here.
        for ctid in &section.containers {
            if tier_by_container.contains_key(ctid) {
                warn!("container {ctid} is listed in more than one tier; last one wins");
            }
            tier_by_container.insert(ctid.clone(), validated.clone());
        }
    }
    // Fallback tier still goes through the same fail-closed validation path;
    // any container not named by a tier section resolves to it lazily in
    // the Tier Resolver rather than being pre-populated here.
    doc.defaults
        .fallback_tier
        .validate()
        .map_err(|source| ConfigError::InvalidTier {
            tier: "default".to_string(),
            source,
        })?;

    debug!(
        "loaded {} tier-associated container(s), {} horizontal group(s)",
        tier_by_container.len(),
        doc.horizontal_groups.len()
    );

    Ok(ResolvedConfig {
        defaults: doc.defaults,
        tier_by_container,
        horizontal_groups: doc.horizontal_groups.into_iter().collect(),
        remote: doc.remote,
    })
}

pub fn load_or_exit(path: &Path) -> Result<ResolvedConfig> {
    load(path).with_context(|| format!("loading configuration from {}", path.display()))
}
