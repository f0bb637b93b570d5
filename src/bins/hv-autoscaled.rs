// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::Parser;
use hv_autoscaled::config::{self, DEFAULT_CONFIG_PATH};
use hv_autoscaled::control_loop::ControlLoop;
use hv_autoscaled::event_log::EventLog;
use hv_autoscaled::executor::{HostExecutor, LocalExecutor, RemoteExecutor};
use hv_autoscaled::lock::SingletonLock;
use hv_autoscaled::state_store::StateStore;
use hv_autoscaled::{logging, rollback};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "hv-autoscaled", about = "Autonomic CPU/memory/clone scaling daemon")]
struct Cli {
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,
    #[arg(long)]
    energy_mode: bool,
    #[arg(long)]
    rollback: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let resolved = match config::load_or_exit(&cli.config) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = logging::init(std::path::Path::new(&resolved.defaults.log_path), cli.verbose) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    match run(cli, resolved).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(
    cli: Cli,
    resolved: hv_autoscaled::config::ResolvedConfig,
) -> Result<()> {
    let executor: Arc<dyn HostExecutor> = match &resolved.remote {
        Some(remote) => {
            info!("using remote executor for {}:{}", remote.host, remote.port);
            Arc::new(
                RemoteExecutor::connect(
                    &remote.host,
                    remote.port,
                    &remote.user,
                    remote.password.as_deref(),
                )
                .await?,
            )
        }
        None => Arc::new(LocalExecutor),
    };

    let host = hostname();

    if cli.rollback {
        info!("hv-autoscaled starting in rollback mode");
        let state_store = StateStore::new(resolved.defaults.backup_dir.clone());
        let event_log = EventLog::open(&resolved.defaults.event_log_path, &host)?;
        rollback::run(executor.as_ref(), &state_store, &event_log).await?;
        info!("rollback complete");
        return Ok(());
    }

    let _lock = SingletonLock::acquire(&resolved.defaults.lock_path)?;
    info!("hv-autoscaled starting (version {})", env!("CARGO_PKG_VERSION"));

    let control_loop = ControlLoop::new(
        executor,
        &resolved,
        host,
        cli.poll_interval.map(Duration::from_secs),
        cli.energy_mode,
    );
    control_loop.run_forever().await?;

    info!("hv-autoscaled stopped");
    Ok(())
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "hv-autoscaled".to_string())
}
