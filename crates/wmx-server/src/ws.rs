//! WebSocket front door: `/ws/mux` for the binary terminal protocol and
//! `/ws/state` for JSON session-state pushes and commands.

use crate::backend::SessionBackend;
use crate::mux::MuxConnectionManager;
use crate::state::SnapshotStore;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use wmx_core::mux::{self, MuxFrameKind};
use wmx_core::{CreateSessionRequest, WmxError, WmxResult};

/// Everything a connection handler needs.
#[derive(Clone)]
pub struct ServerContext {
    pub backend: SessionBackend,
    pub manager: Arc<MuxConnectionManager>,
    pub store: Arc<SnapshotStore>,
    pub state_tx: broadcast::Sender<String>,
}

/// Accept loop. Routes upgrades by request path.
pub async fn run_listener(bind: &str, port: u16, ctx: ServerContext) -> WmxResult<()> {
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| WmxError::Transport(format!("bind {addr} failed: {e}")))?;
    info!(addr = %addr, "WebSocket listener started");

    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move { handle_connection(stream, remote, ctx).await });
            }
            Err(e) => warn!(error = %e, "TCP accept failed"),
        }
    }
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, ctx: ServerContext) {
    let mut path = String::new();
    let callback = |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(remote = %remote, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    match path.as_str() {
        "/ws/mux" => handle_mux(ws, remote, ctx).await,
        "/ws/state" => handle_state(ws, remote, ctx).await,
        other => {
            warn!(remote = %remote, path = other, "unknown WebSocket path");
        }
    }
}

/// The binary terminal channel: init frame, scrollback replay, then a read
/// loop accepting input and resize frames.
async fn handle_mux(ws: WebSocketStream<TcpStream>, remote: SocketAddr, ctx: ServerContext) {
    let client_id = wmx_session::generate_id(16);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let conn = ctx.manager.register(&client_id, out_tx);
    let (mut sink, mut stream) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    conn.send_now(mux::encode_init(&client_id));
    for snapshot in ctx.store.list() {
        match ctx.backend.buffer(&snapshot.id).await {
            Ok(buffer) if !buffer.is_empty() => {
                conn.send_now(mux::encode_output(
                    &snapshot.id,
                    snapshot.cols,
                    snapshot.rows,
                    &buffer,
                ));
            }
            Ok(_) => {}
            Err(e) => debug!(session_id = %snapshot.id, error = %e, "scrollback replay skipped"),
        }
    }
    info!(client_id = %client_id, remote = %remote, "mux client connected");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => match mux::decode(&data) {
                Ok(frame) => match frame.kind {
                    MuxFrameKind::Input => {
                        ctx.backend.send_input(&frame.session_id, &frame.payload).await;
                    }
                    MuxFrameKind::Resize => {
                        let (cols, rows) = mux::parse_resize_payload(&frame.payload);
                        ctx.backend.resize(&frame.session_id, cols, rows).await;
                    }
                    other => debug!(kind = ?other, "ignoring client mux frame"),
                },
                Err(e) => debug!(error = %e, "undecodable mux frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "mux read error");
                break;
            }
        }
    }

    ctx.manager.unregister(&client_id);
    drop(conn);
    let _ = writer.await;
    info!(client_id = %client_id, "mux client disconnected");
}

/// One JSON command from a state-channel client.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
enum StateCommand {
    #[serde(rename_all = "camelCase")]
    Create {
        shell_type: Option<String>,
        working_directory: Option<String>,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Close { session_id: String },
    #[serde(rename_all = "camelCase")]
    Rename { session_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    SetActive {
        session_id: String,
        client_id: String,
    },
}

/// The JSON state channel: one push on connect, one per state change, and
/// inbound session commands.
async fn handle_state(ws: WebSocketStream<TcpStream>, remote: SocketAddr, ctx: ServerContext) {
    let mut pushes = ctx.state_tx.subscribe();
    let (mut sink, mut stream) = ws.split();
    info!(remote = %remote, "state client connected");

    if sink
        .send(Message::Text(ctx.store.to_json().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            push = pushes.recv() => {
                let json = match push {
                    Ok(json) => json,
                    // a lagged receiver just resends the current state
                    Err(broadcast::error::RecvError::Lagged(_)) => ctx.store.to_json(),
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => handle_state_command(&text, &ctx).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(remote = %remote, error = %e, "state read error");
                        break;
                    }
                }
            }
        }
    }
    info!(remote = %remote, "state client disconnected");
}

async fn handle_state_command(text: &str, ctx: &ServerContext) {
    let command: StateCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(error = %e, "malformed state command");
            return;
        }
    };
    match command {
        StateCommand::Create {
            shell_type,
            working_directory,
            cols,
            rows,
        } => {
            let request = CreateSessionRequest {
                shell_type,
                working_directory,
                cols,
                rows,
                ..Default::default()
            };
            if let Err(e) = ctx.backend.create(&request).await {
                warn!(error = %e, "session create failed");
            }
        }
        StateCommand::Close { session_id } => ctx.backend.close(&session_id).await,
        StateCommand::Rename { session_id, name } => {
            ctx.backend.rename(&session_id, &name).await;
        }
        StateCommand::Resize {
            session_id,
            cols,
            rows,
        } => ctx.backend.resize(&session_id, cols, rows).await,
        StateCommand::SetActive {
            session_id,
            client_id,
        } => {
            if !ctx.manager.set_active(&client_id, &session_id) {
                debug!(client_id = %client_id, "setActive for unknown connection");
            }
        }
    }
}
