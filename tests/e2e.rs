// SPDX-License-Identifier: Apache-2.0
#![cfg(feature = "test-helpers")]

//! End-to-end coverage driving the compiled `hv-autoscaled` binary against
//! the fake `pct` fixture in `tests/fixtures/fake-pct.sh`, mirroring the
//! teacher's process-handle-based integration tests.

mod helpers;

use helpers::{install_fake_pct, write_config, DaemonHandle};
use nix::sys::signal::Signal;
use std::time::Duration;
use tempfile::tempdir;

fn base_config(extra: &str) -> String {
    format!(
        r#"
default:
  cpu_upper: 80
  cpu_lower: 20
  mem_upper: 80
  mem_lower: 20
  min_cores: 1
  max_cores: 4
  min_memory: 512
  core_min_increment: 1
  core_max_increment: 2
  memory_min_increment: 256
  min_decrease_chunk: 128
  tier_label: default
{extra}
"#
    )
}

struct Harness {
    _root: tempfile::TempDir,
    config_path: std::path::PathBuf,
    log_path: std::path::PathBuf,
    bin_dir: std::path::PathBuf,
    state_dir: std::path::PathBuf,
}

impl Harness {
    fn new(config_yaml: &str) -> Self {
        let root = tempdir().unwrap();
        let state_dir = root.path().join("pct-state");
        let bin_dir = install_fake_pct(&root.path().join("bin"), &state_dir);

        let log_path = root.path().join("hv-autoscale.log");
        let lock_path = root.path().join("hv-autoscale.lock");
        let backup_dir = root.path().join("backups");
        let event_log_path = root.path().join("events.ndjson");

        let full_yaml = format!(
            "default:\n  log_path: {log:?}\n  lock_path: {lock:?}\n  backup_dir: {backup:?}\n  event_log_path: {events:?}\n{rest}",
            log = log_path.display().to_string(),
            lock = lock_path.display().to_string(),
            backup = backup_dir.display().to_string(),
            events = event_log_path.display().to_string(),
            rest = config_yaml.trim_start_matches("\ndefault:\n"),
        );

        let config_path = root.path().join("config.yaml");
        write_config(&config_path, &full_yaml);

        Self {
            _root: root,
            config_path,
            log_path,
            bin_dir,
            state_dir,
        }
    }

    fn start(&self) -> DaemonHandle {
        DaemonHandle::start(&self.config_path, &self.bin_dir, &self.log_path, &self.state_dir)
    }

    fn container_dir(&self, id: &str) -> std::path::PathBuf {
        self.state_dir.join(id)
    }
}

fn ensure_container(dir: &std::path::Path, cores: u32, memory_mib: u64) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("cores"), cores.to_string()).unwrap();
    std::fs::write(dir.join("memory"), memory_mib.to_string()).unwrap();
    std::fs::write(dir.join("status"), "running").unwrap();
}

#[test]
fn daemon_increases_cores_for_a_hot_container() {
    let harness = Harness::new(&base_config(""));
    let dir = harness.container_dir("101");
    ensure_container(&dir, 1, 1024);
    std::fs::write(dir.join("loadavg"), "5.00 5.00 5.00 1/200 99\n").unwrap();

    let mut daemon = harness.start();
    assert!(
        daemon.wait_for_log("IncreaseCores", Duration::from_secs(15)),
        "expected an IncreaseCores event within the timeout"
    );

    let cores: u32 = std::fs::read_to_string(dir.join("cores"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(cores > 1, "cores should have grown past the starting value, got {cores}");

    daemon.stop();
}

#[test]
fn daemon_increases_memory_for_a_pressured_container() {
    let harness = Harness::new(&base_config(""));
    let dir = harness.container_dir("102");
    ensure_container(&dir, 2, 1024);
    std::fs::write(
        dir.join("meminfo"),
        "MemTotal:  1000000 kB\nMemAvailable: 50000 kB\n",
    )
    .unwrap();

    let mut daemon = harness.start();
    assert!(
        daemon.wait_for_log("IncreaseMemory", Duration::from_secs(15)),
        "expected an IncreaseMemory event within the timeout"
    );

    let memory: u64 = std::fs::read_to_string(dir.join("memory"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(memory > 1024, "memory should have grown, got {memory}");

    daemon.stop();
}

#[test]
fn second_instance_is_rejected_by_the_singleton_lock() {
    let harness = Harness::new(&base_config(""));
    ensure_container(&harness.container_dir("101"), 1, 1024);

    let mut first = harness.start();
    assert!(first.wait_for_log("hv-autoscaled starting", Duration::from_secs(10)));

    let mut second = harness.start();
    let status = second.wait_with_timeout(Duration::from_secs(10));
    assert!(!status.success(), "second instance should exit non-zero");

    first.stop();
}

#[test]
fn graceful_shutdown_on_sigterm() {
    let harness = Harness::new(&base_config(""));
    ensure_container(&harness.container_dir("101"), 1, 1024);

    let mut daemon = harness.start();
    assert!(daemon.wait_for_log("hv-autoscaled starting", Duration::from_secs(10)));

    daemon.send_signal(Signal::SIGTERM);
    let status = daemon.wait_with_timeout(Duration::from_secs(10));
    assert!(status.success(), "daemon should exit 0 on SIGTERM");
    assert!(daemon.wait_for_log("hv-autoscaled stopped", Duration::from_secs(5)));
}

#[test]
fn rollback_mode_restores_backed_up_settings() {
    let harness = Harness::new(&base_config(""));
    let dir = harness.container_dir("101");
    ensure_container(&dir, 1, 1024);
    std::fs::write(dir.join("loadavg"), "5.00 5.00 5.00 1/200 99\n").unwrap();

    let mut daemon = harness.start();
    assert!(daemon.wait_for_log("IncreaseCores", Duration::from_secs(15)));
    daemon.stop();

    let cores_after_scale_out: u32 = std::fs::read_to_string(dir.join("cores"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(cores_after_scale_out > 1);

    let bin = env!("CARGO_BIN_EXE_hv-autoscaled");
    let path_var = format!(
        "{}:{}",
        harness.bin_dir.display(),
        std::env::var("PATH").unwrap_or_default()
    );
    let status = std::process::Command::new(bin)
        .arg("--config")
        .arg(&harness.config_path)
        .arg("--rollback")
        .env("PATH", path_var)
        .env("PCT_STATE_DIR", &harness.state_dir)
        .status()
        .expect("failed to run rollback");
    assert!(status.success());

    let cores_after_rollback: u32 = std::fs::read_to_string(dir.join("cores"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(cores_after_rollback, 1, "rollback should restore the pre-scale core count");
}
