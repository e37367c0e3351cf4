use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use kubemux_types::SshEndpoint;

use crate::error::{EngineError, Result};

/// Handshake and readiness bound for SSH operations
const SSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the forward listener to come up
const READY_POLL: Duration = Duration::from_millis(200);

struct Tunnel {
    local_port: u16,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

/// Owns SSH-forwarded local listeners, one per connection id.
///
/// Each tunnel is a managed `ssh -N -L` child bridging an OS-assigned local
/// port to a remote host:port; inbound connections to the listener become
/// forwarded channels over the authenticated SSH session. Creating a second
/// tunnel for a connection id closes the first.
pub struct TunnelManager {
    tunnels: Mutex<HashMap<String, Tunnel>>,
    ssh_binary: String,
}

impl TunnelManager {
    pub fn new(ssh_binary: String) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            ssh_binary,
        }
    }

    /// Establish a tunnel for a connection, returning the local listener port.
    ///
    /// Any existing tunnel for the id is closed first so no listener leaks.
    pub async fn create_tunnel(
        &self,
        connection_id: &str,
        ssh: &SshEndpoint,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<u16> {
        self.close_tunnel(connection_id);

        let local_port = pick_local_port()
            .map_err(|e| EngineError::Transport(format!("failed to reserve local port: {}", e)))?;

        let mut child = Command::new(&self.ssh_binary)
            .args(forward_args(ssh, local_port, remote_host, remote_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Transport(format!("failed to spawn ssh: {}", e)))?;

        // Wait for the local listener, racing against child exit
        let deadline = tokio::time::Instant::now() + SSH_TIMEOUT;
        loop {
            if TcpStream::connect(("127.0.0.1", local_port)).await.is_ok() {
                break;
            }

            if let Ok(Some(status)) = child.try_wait() {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                tracing::warn!(connection = connection_id, %status, "ssh tunnel exited early");
                return Err(classify_ssh_failure(stderr.trim()));
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(EngineError::Transport(format!(
                    "timed out waiting for tunnel to {}:{}",
                    remote_host, remote_port
                )));
            }

            tokio::time::sleep(READY_POLL).await;
        }

        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));

        // Child waiter: tear down on cancel, mark dead on unexpected exit
        {
            let cancel = cancel.clone();
            let alive = Arc::clone(&alive);
            let connection = connection_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                    status = child.wait() => {
                        alive.store(false, Ordering::SeqCst);
                        tracing::warn!(connection = %connection, ?status, "ssh tunnel terminated");
                    }
                }
            });
        }

        tracing::debug!(
            connection = connection_id,
            local_port,
            remote = format!("{}:{}", remote_host, remote_port),
            "tunnel established"
        );

        self.register(
            connection_id,
            Tunnel {
                local_port,
                cancel,
                alive,
            },
        );

        Ok(local_port)
    }

    /// Insert a tunnel, killing any entry it displaces.
    ///
    /// A concurrent create for the same id may have registered between the
    /// initial close and this insert; cancelling the displaced entry keeps
    /// exactly one child per connection id.
    fn register(&self, connection_id: &str, tunnel: Tunnel) {
        let displaced = self.tunnels.lock().insert(connection_id.to_string(), tunnel);
        if let Some(old) = displaced {
            old.cancel.cancel();
        }
    }

    /// Close the connection's tunnel, if any. Idempotent.
    pub fn close_tunnel(&self, connection_id: &str) {
        if let Some(tunnel) = self.tunnels.lock().remove(connection_id) {
            tunnel.cancel.cancel();
            tracing::debug!(connection = connection_id, "tunnel closed");
        }
    }

    /// The local listener port of a live tunnel
    pub fn local_port(&self, connection_id: &str) -> Option<u16> {
        let tunnels = self.tunnels.lock();
        tunnels.get(connection_id).map(|t| t.local_port)
    }

    /// Whether the connection's tunnel child is still running
    pub fn is_alive(&self, connection_id: &str) -> bool {
        let tunnels = self.tunnels.lock();
        tunnels
            .get(connection_id)
            .map(|t| t.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Perform only the SSH handshake, bounded by the 10 s timeout.
    ///
    /// No tunnel is left behind; the result is a plain success flag.
    pub async fn test_connection(&self, ssh: &SshEndpoint) -> bool {
        let child = Command::new(&self.ssh_binary)
            .args(probe_args(ssh))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let Ok(mut child) = child else {
            return false;
        };

        match tokio::time::timeout(SSH_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            _ => {
                let _ = child.start_kill();
                false
            }
        }
    }

    /// Close every tunnel
    pub fn close_all(&self) {
        let drained: Vec<_> = self.tunnels.lock().drain().collect();
        for (_, tunnel) in drained {
            tunnel.cancel.cancel();
        }
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Reserve an OS-assigned ephemeral port on the loopback interface
fn pick_local_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Arguments for the forwarding child: `ssh -N -L local:remote` with
/// key-based, non-interactive auth
fn forward_args(
    ssh: &SshEndpoint,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Vec<String> {
    let mut args = base_args(ssh);
    args.push("-o".to_string());
    args.push("ExitOnForwardFailure=yes".to_string());
    args.push("-N".to_string());
    args.push("-L".to_string());
    args.push(format!(
        "127.0.0.1:{}:{}:{}",
        local_port, remote_host, remote_port
    ));
    args.push(ssh.destination());
    args
}

/// Arguments for a handshake-only probe: connect, run `exit`, report status
fn probe_args(ssh: &SshEndpoint) -> Vec<String> {
    let mut args = base_args(ssh);
    args.push(ssh.destination());
    args.push("exit".to_string());
    args
}

fn base_args(ssh: &SshEndpoint) -> Vec<String> {
    vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", SSH_TIMEOUT.as_secs()),
        "-p".to_string(),
        ssh.port.to_string(),
        "-i".to_string(),
        ssh.private_key_path.clone(),
    ]
}

/// Map ssh stderr to the failure taxonomy: credential rejections are auth
/// failures, everything else is transport.
fn classify_ssh_failure(stderr: &str) -> EngineError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("permission denied")
        || lowered.contains("authentication")
        || lowered.contains("no supported authentication")
    {
        EngineError::Auth(stderr.to_string())
    } else {
        EngineError::Transport(if stderr.is_empty() {
            "ssh exited before the tunnel was ready".to_string()
        } else {
            stderr.to_string()
        })
    }
}
