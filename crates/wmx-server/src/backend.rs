//! The session backend: where sessions actually live.
//!
//! Standalone mode keeps a registry in-process; sidecar mode proxies to
//! `wmx-host` through the sidecar client. The mux layer and the state plane
//! only talk to this surface.

use crate::sidecar::SidecarClient;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;
use wmx_core::{CreateSessionRequest, SessionSnapshot, WmxResult};
use wmx_session::{CreateSession, SessionRegistry, ShellKind};

#[derive(Clone)]
pub enum SessionBackend {
    Local(Arc<SessionRegistry>),
    Remote(Arc<SidecarClient>),
}

impl SessionBackend {
    pub async fn create(&self, request: &CreateSessionRequest) -> WmxResult<SessionSnapshot> {
        match self {
            Self::Local(registry) => {
                let shell = match &request.shell_type {
                    Some(name) => Some(ShellKind::from_str(name)?),
                    None => None,
                };
                registry
                    .create_session(CreateSession {
                        shell,
                        working_directory: request.working_directory.clone().map(Into::into),
                        cols: Some(request.cols),
                        rows: Some(request.rows),
                        run_as: None,
                    })
                    .await
            }
            Self::Remote(client) => client.create_session(request).await,
        }
    }

    pub async fn close(&self, session_id: &str) {
        match self {
            Self::Local(registry) => registry.close_session(session_id).await,
            Self::Remote(client) => client.close_session(session_id).await,
        }
    }

    pub async fn send_input(&self, session_id: &str, data: &[u8]) {
        match self {
            Self::Local(registry) => registry.send_input(session_id, data).await,
            Self::Remote(client) => client.send_input(session_id, data).await,
        }
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        match self {
            Self::Local(registry) => {
                if let Err(e) = registry.resize_session(session_id, cols, rows).await {
                    warn!(session_id, error = %e, "resize failed");
                }
            }
            Self::Remote(client) => client.resize(session_id, cols, rows).await,
        }
    }

    /// Rename a session. The sidecar protocol has no rename message, so in
    /// sidecar mode this is a logged no-op.
    pub async fn rename(&self, session_id: &str, name: &str) {
        match self {
            Self::Local(registry) => {
                if let Err(e) = registry.rename_session(session_id, name).await {
                    warn!(session_id, error = %e, "rename failed");
                }
            }
            Self::Remote(_) => {
                warn!(session_id, "rename is not supported in sidecar mode");
            }
        }
    }

    pub async fn list(&self) -> WmxResult<Vec<SessionSnapshot>> {
        match self {
            Self::Local(registry) => Ok(registry.session_list().await),
            Self::Remote(client) => client.list_sessions().await,
        }
    }

    /// Scrollback contents for replay to a newly-connected mux client.
    pub async fn buffer(&self, session_id: &str) -> WmxResult<Vec<u8>> {
        match self {
            Self::Local(registry) => Ok(registry.buffer(session_id).await),
            Self::Remote(client) => client.get_buffer(session_id).await,
        }
    }
}
