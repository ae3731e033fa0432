//! wmx-server: WebSocket terminal multiplexer front-end.
//!
//! Serves browser clients over `/ws/mux` (binary terminal protocol) and
//! `/ws/state` (JSON session state). Sessions live either in-process
//! (standalone mode) or in the `wmx-host` sidecar, where they survive
//! front-end restarts.

mod backend;
mod config;
mod lifecycle;
mod mux;
mod sidecar;
mod state;
mod ws;

use backend::SessionBackend;
use clap::Parser;
use config::AppConfig;
use lifecycle::HostLifecycle;
use mux::{MuxConnectionManager, MuxTuning};
use sidecar::{SidecarClient, SidecarEvent};
use state::SnapshotStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use wmx_core::IpcEndpoint;
use wmx_session::{RegistryConfig, SessionRegistry};
use ws::ServerContext;

/// wmx-server: web terminal multiplexer
#[derive(Parser, Debug)]
#[command(name = "wmx-server", version, about = "Web terminal multiplexer")]
struct Cli {
    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path (default: ~/.config/wmx/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run sessions in-process instead of in the wmx-host sidecar
    #[arg(long)]
    standalone: bool,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let default_level = if cli.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match AppConfig::load(
        cli.config.as_deref(),
        cli.bind.as_deref(),
        cli.port,
        cli.standalone,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        port = config.port,
        standalone = config.standalone,
        "starting wmx-server"
    );

    let store = Arc::new(SnapshotStore::new());
    let manager = MuxConnectionManager::new(MuxTuning::default());
    let (state_tx, _) = broadcast::channel::<String>(64);

    let mut local_registry: Option<Arc<SessionRegistry>> = None;
    let backend = if config.standalone {
        let registry = start_local(&config, store.clone(), manager.clone(), state_tx.clone());
        local_registry = Some(registry.clone());
        SessionBackend::Local(registry)
    } else {
        match start_sidecar(&config, store.clone(), manager.clone(), state_tx.clone()).await {
            Ok(client) => SessionBackend::Remote(client),
            Err(e) => {
                error!(error = %e, "failed to reach wmx-host");
                std::process::exit(1);
            }
        }
    };

    let ctx = ServerContext {
        backend,
        manager,
        store,
        state_tx,
    };

    tokio::select! {
        result = ws::run_listener(&config.bind, config.port, ctx) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    if let Some(registry) = local_registry {
        registry.close_all().await;
    }
    info!("wmx-server stopped");
}

/// Standalone mode: in-process registry with event pumps into the mux layer
/// and the state plane.
fn start_local(
    config: &AppConfig,
    store: Arc<SnapshotStore>,
    manager: Arc<MuxConnectionManager>,
    state_tx: broadcast::Sender<String>,
) -> Arc<SessionRegistry> {
    let registry = SessionRegistry::new(RegistryConfig {
        default_shell: config.default_shell,
        default_working_directory: config.default_working_directory.clone(),
        scrollback_chars: Some(config.scrollback_chars),
        run_as: Default::default(),
    });

    let (_output_listener, mut output_rx) = registry.add_output_listener();
    {
        let store = store.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some(event) = output_rx.recv().await {
                let (cols, rows) = store.dims(&event.session_id);
                manager.broadcast_output(&event.session_id, cols, rows, &event.data);
            }
        });
    }

    let (_state_listener, mut state_rx) = registry.add_state_listener();
    tokio::spawn(async move {
        while let Some(snapshot) = state_rx.recv().await {
            if snapshot.is_tombstone() {
                manager.drop_session(&snapshot.id);
            }
            store.apply(snapshot);
            let _ = state_tx.send(store.to_json());
        }
    });

    registry
}

/// Sidecar mode: connect to (or spawn) wmx-host, seed the snapshot store,
/// and pump host events into the mux layer and the state plane.
async fn start_sidecar(
    config: &AppConfig,
    store: Arc<SnapshotStore>,
    manager: Arc<MuxConnectionManager>,
    state_tx: broadcast::Sender<String>,
) -> wmx_core::WmxResult<Arc<SidecarClient>> {
    let endpoint = match &config.endpoint {
        Some(path) => IpcEndpoint::at(path.clone()),
        None => IpcEndpoint::resolve(),
    };
    let (client, mut events) = SidecarClient::new(endpoint, config.secret.clone());
    let lifecycle = Arc::new(HostLifecycle::new(
        client.clone(),
        config.auto_spawn,
        config.host_path.clone(),
        config.endpoint.clone(),
        config.secret.clone(),
    ));
    lifecycle.ensure_connected().await?;

    match client.list_sessions().await {
        Ok(sessions) => {
            info!(count = sessions.len(), "adopted sessions from host");
            store.replace_all(sessions);
            let _ = state_tx.send(store.to_json());
        }
        Err(e) => warn!(error = %e, "initial session list failed"),
    }

    let pump_client = client.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SidecarEvent::Output { session_id, data } => {
                    let (cols, rows) = store.dims(&session_id);
                    manager.broadcast_output(&session_id, cols, rows, &data);
                }
                SidecarEvent::State(snapshot) => {
                    if snapshot.is_tombstone() {
                        manager.drop_session(&snapshot.id);
                    }
                    store.apply(snapshot);
                    let _ = state_tx.send(store.to_json());
                }
                SidecarEvent::Disconnected => {
                    warn!("host connection lost, reconnecting");
                    lifecycle.reconnect().await;
                    if let Ok(sessions) = pump_client.list_sessions().await {
                        store.replace_all(sessions);
                        let _ = state_tx.send(store.to_json());
                    }
                }
            }
        }
    });

    Ok(client)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
