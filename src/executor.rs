// SPDX-License-Identifier: Apache-2.0

//! The Host Executor (spec.md §4.1): a trait abstracting over how argv-style
//! commands actually run on the hypervisor host, with a local and a remote
//! (SSH) backend so the rest of the daemon never branches on transport.

use crate::error::ExecError;
use async_trait::async_trait;
use log::{debug, trace};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Snapshot-and-clone runs far longer than a routine `pct set`.
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs a pre-tokenized command on the hypervisor host and returns its
/// captured stdout. Commands are never passed through a shell: argv is
/// executed directly, so no caller needs to worry about metacharacter
/// expansion in a container id or hostname.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<String, ExecError>;
}

/// Runs commands as direct child processes of the daemon.
pub struct LocalExecutor;

#[async_trait]
impl HostExecutor for LocalExecutor {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<String, ExecError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::Transport("empty argv".to_string()));
        };
        trace!("local exec: {argv:?}");
        let mut command = tokio::process::Command::new(program);
        command.args(args);
        command.kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| ExecError::Timeout(timeout))?
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        if !output.status.success() {
            return Err(ExecError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> impl future::Future<Output = Result<bool, Self::Error>> + Send {
        // The hypervisor host is operator-supplied configuration, not an
        // untrusted peer; host key pinning is left to the surrounding
        // network (spec.md treats SSH transport setup as out of scope).
        future::ready(Ok(true))
    }
}

/// Runs commands over a single persistent SSH session to a remote
/// hypervisor host. Access is serialized behind a mutex so concurrent
/// probe/scale callers never interleave channel setup on one connection.
pub struct RemoteExecutor {
    handle: Mutex<Handle<AcceptingHandler>>,
    user: String,
}

impl RemoteExecutor {
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
    ) -> Result<Self, ExecError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ExecError::Transport(format!("connecting to {host}:{port}: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        let config = Arc::new(client::Config {
            nodelay: true,
            keepalive_interval: Some(Duration::from_secs(15)),
            ..Default::default()
        });
        let mut handle = client::connect_stream(config, tcp, AcceptingHandler)
            .await
            .map_err(|e| ExecError::Transport(format!("ssh handshake: {e}")))?;

        let password = password.ok_or_else(|| {
            ExecError::Transport("remote executor requires password auth".to_string())
        })?;
        let auth = handle
            .authenticate_password(user, password)
            .await
            .map_err(|e| ExecError::Transport(format!("ssh auth: {e}")))?;
        if !auth.success() {
            return Err(ExecError::Transport(
                "ssh authentication rejected".to_string(),
            ));
        }

        debug!("remote executor connected to {host}:{port} as {user}");
        Ok(Self {
            handle: Mutex::new(handle),
            user: user.to_string(),
        })
    }
}

#[async_trait]
impl HostExecutor for RemoteExecutor {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<String, ExecError> {
        if argv.is_empty() {
            return Err(ExecError::Transport("empty argv".to_string()));
        }
        // russh has no argv-exec primitive; shell-quote each argument so
        // the remote shell still sees discrete, unexpanded tokens.
        let command_line = argv
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        trace!("remote exec ({}): {command_line}", self.user);

        let handle = self.handle.lock().await;
        let run = async {
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| ExecError::Transport(format!("opening channel: {e}")))?;
            channel
                .exec(true, command_line.as_bytes())
                .await
                .map_err(|e| ExecError::Transport(format!("exec request: {e}")))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, .. } => stderr.extend_from_slice(data),
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }

            match exit_code {
                Some(0) | None => Ok(String::from_utf8_lossy(&stdout).into_owned()),
                Some(code) => Err(ExecError::NonZeroExit {
                    code,
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                }),
            }
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ExecError::Timeout(timeout))?
    }
}

impl Drop for RemoteExecutor {
    fn drop(&mut self) {
        if let Ok(handle) = self.handle.try_lock() {
            let _ = handle.disconnect(Disconnect::ByApplication, "shutting down", "");
        }
    }
}

fn shell_quote(arg: &str) -> String {
    if arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c)) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_echo_succeeds() {
        let exec = LocalExecutor;
        let out = exec
            .run(&["echo".to_string(), "hi".to_string()], DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(out.trim(), "hi");
    }

    #[tokio::test]
    async fn test_local_nonzero_exit_reported() {
        let exec = LocalExecutor;
        let err = exec
            .run(&["false".to_string()], DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn test_local_timeout_is_reported() {
        let exec = LocalExecutor;
        let err = exec
            .run(
                &["sleep".to_string(), "5".to_string()],
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        let exec = LocalExecutor;
        let err = exec.run(&[], DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ExecError::Transport(_)));
    }

    #[test]
    fn test_shell_quote_passes_plain_tokens_through() {
        assert_eq!(shell_quote("101"), "101");
        assert_eq!(shell_quote("-memory"), "-memory");
    }

    #[test]
    fn test_shell_quote_escapes_metacharacters() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
