// SPDX-License-Identifier: Apache-2.0

//! Logging setup (SPEC_FULL §2, §6): initializes `env_logger` so every
//! component's `log::{info,warn,error,debug}` call lands in the
//! companion human-readable log file alongside the structured event log.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;

/// `verbosity` follows the common CLI convention: 0 = info, 1 = debug,
/// 2+ = trace, overridable at any level by `RUST_LOG`.
pub fn init(log_path: &Path, verbosity: u8) -> Result<()> {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let target = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Pipe(Box::new(target)))
        .format_timestamp_millis()
        .try_init()
        .map_err(|e| anyhow::anyhow!("initializing logger: {e}"))
}
