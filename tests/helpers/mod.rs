// SPDX-License-Identifier: Apache-2.0

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sets up a `pct`-named copy of the fake container CLI on its own PATH
/// entry, the same "stand-in CLI on PATH" shape the teacher's e2e tests
/// use for the managed-process command under test.
pub fn install_fake_pct(bin_dir: &Path, state_dir: &Path) -> PathBuf {
    std::fs::create_dir_all(bin_dir).unwrap();
    std::fs::create_dir_all(state_dir).unwrap();
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake-pct.sh");
    let target = bin_dir.join("pct");
    std::fs::copy(&fixture, &target).expect("failed to install fake pct script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&target).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&target, perms).unwrap();
    }
    bin_dir.to_path_buf()
}

/// Handle to a running hv-autoscaled daemon process.
pub struct DaemonHandle {
    child: Child,
    log_path: PathBuf,
    _stdout_thread: std::thread::JoinHandle<()>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

impl DaemonHandle {
    pub fn start(config_path: &Path, bin_dir: &Path, log_path: &Path, state_dir: &Path) -> Self {
        let bin = env!("CARGO_BIN_EXE_hv-autoscaled");
        let path_var = format!(
            "{}:{}",
            bin_dir.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let mut child = Command::new(bin)
            .arg("--config")
            .arg(config_path)
            .arg("--poll-interval")
            .arg("1")
            .env("PATH", path_var)
            .env("PCT_STATE_DIR", state_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start hv-autoscaled");

        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");

        let stdout_thread = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                eprintln!("[daemon] {line}");
            }
        });
        let stderr_thread = std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                eprintln!("[daemon:err] {line}");
            }
        });

        Self {
            child,
            log_path: log_path.to_path_buf(),
            _stdout_thread: stdout_thread,
            _stderr_thread: stderr_thread,
        }
    }

    /// Polls the daemon's log file (env_logger writes there, not to
    /// stdout/stderr) until `pattern` appears or `timeout` elapses.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(contents) = std::fs::read_to_string(&self.log_path) {
                if contents.contains(pattern) {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log(pattern, DEFAULT_TIMEOUT)
    }

    pub fn send_signal(&self, sig: Signal) {
        let pid = self.child.id() as i32;
        signal::kill(Pid::from_raw(pid), sig).expect("failed to signal daemon");
    }

    pub fn stop(&mut self) -> std::process::ExitStatus {
        self.send_signal(Signal::SIGTERM);
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn wait_with_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait().expect("failed to check daemon status") {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed daemon");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn write_config(path: &Path, yaml: &str) {
    std::fs::write(path, yaml)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
}
