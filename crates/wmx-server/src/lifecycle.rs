//! Host process lifecycle: spawn `wmx-host` when it is not running, and
//! reconnect with backoff after a connection loss.
//!
//! The host is deliberately never killed from here; its sessions must
//! survive front-end restarts.

use crate::sidecar::SidecarClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wmx_core::{WmxError, WmxResult};

const SPAWN_POLL_ATTEMPTS: u32 = 30;
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_FACTOR: f64 = 1.5;
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub struct HostLifecycle {
    client: Arc<SidecarClient>,
    auto_spawn: bool,
    host_path: Option<PathBuf>,
    endpoint_override: Option<PathBuf>,
    secret: Option<String>,
}

impl HostLifecycle {
    pub fn new(
        client: Arc<SidecarClient>,
        auto_spawn: bool,
        host_path: Option<PathBuf>,
        endpoint_override: Option<PathBuf>,
        secret: Option<String>,
    ) -> Self {
        Self {
            client,
            auto_spawn,
            host_path,
            endpoint_override,
            secret,
        }
    }

    /// Connect to a running host, spawning one first when allowed.
    pub async fn ensure_connected(&self) -> WmxResult<()> {
        if self.client.connect().await.is_ok() {
            return Ok(());
        }
        if !self.auto_spawn {
            return Err(WmxError::Transport(
                "host not reachable and auto-spawn is disabled".to_string(),
            ));
        }

        self.spawn_host()?;
        for _ in 0..SPAWN_POLL_ATTEMPTS {
            tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
            if self.client.connect().await.is_ok() {
                return Ok(());
            }
        }
        Err(WmxError::Transport(
            "host did not become reachable after spawn".to_string(),
        ))
    }

    /// Reconnect after a Disconnected event. Backs off exponentially and
    /// only returns once connected again.
    pub async fn reconnect(&self) {
        let mut delay = RECONNECT_INITIAL;
        loop {
            tokio::time::sleep(delay).await;
            match self.ensure_connected().await {
                Ok(()) => {
                    info!("reconnected to host");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "reconnect failed");
                    delay = next_backoff(delay);
                }
            }
        }
    }

    fn spawn_host(&self) -> WmxResult<()> {
        let path = match &self.host_path {
            Some(path) => path.clone(),
            None => default_host_path()?,
        };
        info!(path = %path.display(), "spawning host process");

        let mut cmd = std::process::Command::new(&path);
        if let Some(endpoint) = &self.endpoint_override {
            cmd.arg("--endpoint").arg(endpoint);
        }
        if let Some(secret) = &self.secret {
            cmd.arg("--secret").arg(secret);
        }
        cmd.spawn()
            .map(|_| ())
            .map_err(|e| WmxError::Transport(format!("spawn {} failed: {e}", path.display())))
    }
}

/// The host binary beside the current executable.
fn default_host_path() -> WmxResult<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| WmxError::Transport(format!("cannot locate current executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| WmxError::Transport("executable has no parent directory".to_string()))?;
    Ok(dir.join(host_binary_name()))
}

fn host_binary_name() -> &'static str {
    if cfg!(windows) {
        "wmx-host.exe"
    } else {
        "wmx-host"
    }
}

fn next_backoff(delay: Duration) -> Duration {
    let next = delay.mul_f64(RECONNECT_FACTOR);
    next.min(RECONNECT_MAX)
}
