//! wmx-host: sidecar session host.
//!
//! Owns the PTY sessions and serves them to front-end processes over the
//! framed IPC transport, so sessions survive front-end restarts.

mod server;

use clap::Parser;
use server::HostServer;
use tracing::{error, info};
use wmx_core::{IpcEndpoint, IpcListener};
use wmx_session::{RegistryConfig, RunAs, SessionRegistry};

/// wmx-host: session host for wmx
#[derive(Parser, Debug)]
#[command(name = "wmx-host", version, about = "wmx session host")]
struct Cli {
    /// Socket path or pipe name (default: per-user endpoint)
    #[arg(long)]
    endpoint: Option<String>,

    /// Shared handshake secret front-ends must present
    #[arg(long)]
    secret: Option<String>,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting wmx-host");

    let endpoint = match &cli.endpoint {
        Some(path) => IpcEndpoint::at(path),
        None => IpcEndpoint::resolve(),
    };

    let listener = match IpcListener::bind(&endpoint) {
        Ok(l) => l,
        Err(e) => {
            error!(endpoint = %endpoint, error = %e, "failed to bind endpoint");
            std::process::exit(1);
        }
    };

    let registry = SessionRegistry::new(RegistryConfig {
        run_as: run_as_from_env(),
        ..Default::default()
    });
    let host = HostServer::new(registry.clone(), cli.secret.clone());

    tokio::select! {
        result = host.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "host error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            registry.close_all().await;
        }
    }

    info!("wmx-host stopped");
}

/// Registry-level run-as defaults, handed down by the spawning front-end.
fn run_as_from_env() -> RunAs {
    RunAs {
        user: std::env::var("WMX_RUN_AS_USER").ok().filter(|s| !s.is_empty()),
        user_sid: std::env::var("WMX_RUN_AS_USER_SID").ok().filter(|s| !s.is_empty()),
        uid: std::env::var("WMX_RUN_AS_UID").ok().and_then(|s| s.parse().ok()),
        gid: std::env::var("WMX_RUN_AS_GID").ok().and_then(|s| s.parse().ok()),
    }
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
