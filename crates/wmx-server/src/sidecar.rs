//! Client side of the sidecar protocol.
//!
//! Maintains one connection to `wmx-host`, correlates request/response pairs
//! through pending one-shot waiters, and surfaces host-pushed output and
//! state changes as events. All request paths resolve within their timeout;
//! nothing awaits the host forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use wmx_core::sidecar::{encode_handshake, parse_error, IpcMessageType};
use wmx_core::{
    CreateSessionRequest, IpcEndpoint, IpcFrame, IpcTransport, IpcWriter, SessionSnapshot,
    WmxError, WmxResult, PROTOCOL_VERSION,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Events pushed by the host, plus the connection-loss marker.
#[derive(Debug)]
pub enum SidecarEvent {
    Output { session_id: String, data: Vec<u8> },
    State(SessionSnapshot),
    Disconnected,
}

/// Per-request-kind timeouts. Injectable so tests do not wait out the
/// production values.
#[derive(Debug, Clone)]
pub struct SidecarTimeouts {
    pub create: Duration,
    pub list: Duration,
    pub buffer: Duration,
}

impl Default for SidecarTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(10),
            list: Duration::from_secs(5),
            buffer: Duration::from_secs(5),
        }
    }
}

pub struct SidecarClient {
    endpoint: IpcEndpoint,
    secret: Option<String>,
    timeouts: SidecarTimeouts,
    connect_lock: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    writer: Mutex<Option<IpcWriter>>,
    pending: Mutex<HashMap<String, oneshot::Sender<IpcFrame>>>,
    events: mpsc::UnboundedSender<SidecarEvent>,
}

impl SidecarClient {
    pub fn new(
        endpoint: IpcEndpoint,
        secret: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SidecarEvent>) {
        Self::with_timeouts(endpoint, secret, SidecarTimeouts::default())
    }

    pub fn with_timeouts(
        endpoint: IpcEndpoint,
        secret: Option<String>,
        timeouts: SidecarTimeouts,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SidecarEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            endpoint,
            secret,
            timeouts,
            connect_lock: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            events,
        });
        (client, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect and handshake. A no-op when already connected; concurrent
    /// callers serialize on the connect lock.
    pub async fn connect(self: &Arc<Self>) -> WmxResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let transport = IpcTransport::connect(&self.endpoint).await?;
        self.establish(transport).await
    }

    /// Handshake over an already-connected transport, then start the read
    /// loop and heartbeat.
    pub(crate) async fn establish(self: &Arc<Self>, mut transport: IpcTransport) -> WmxResult<()> {
        let writer = transport.writer();
        let hello = IpcFrame::new(
            IpcMessageType::Handshake,
            "",
            encode_handshake(PROTOCOL_VERSION, self.secret.as_deref().unwrap_or("")),
        );
        writer.write_frame(&hello).await?;

        match transport.read_frame().await? {
            Some(frame) if frame.kind == IpcMessageType::HandshakeAck => {}
            Some(frame) if frame.kind == IpcMessageType::Error => {
                return Err(WmxError::Protocol(parse_error(&frame.payload)));
            }
            Some(frame) => {
                return Err(WmxError::Protocol(format!(
                    "unexpected handshake reply: {:?}",
                    frame.kind
                )));
            }
            None => return Err(WmxError::Disconnected),
        }

        *self.writer.lock().expect("writer lock poisoned") = Some(writer.clone());
        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "connected to host");

        let client = self.clone();
        tokio::spawn(async move { client.read_loop(transport).await });
        let client = self.clone();
        tokio::spawn(async move { client.heartbeat(writer).await });
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut transport: IpcTransport) {
        loop {
            match transport.read_frame().await {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "host stream error");
                    break;
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().expect("writer lock poisoned") = None;
        self.cancel_pendings();
        info!("host connection lost");
        let _ = self.events.send(SidecarEvent::Disconnected);
    }

    fn handle_frame(&self, frame: IpcFrame) {
        match frame.kind {
            IpcMessageType::Output => {
                let _ = self.events.send(SidecarEvent::Output {
                    session_id: frame.session_id,
                    data: frame.payload,
                });
            }
            IpcMessageType::StateChange => match SessionSnapshot::parse(&frame.payload) {
                Ok(snapshot) => {
                    let _ = self.events.send(SidecarEvent::State(snapshot));
                }
                Err(e) => warn!(error = %e, "bad StateChange payload"),
            },
            IpcMessageType::SessionCreated
            | IpcMessageType::SessionList
            | IpcMessageType::Buffer
            | IpcMessageType::Error => self.resolve_pending(frame),
            IpcMessageType::Heartbeat => {}
            other => debug!(kind = ?other, "ignoring unexpected frame from host"),
        }
    }

    /// Resolve the waiter under the frame's session-id key, falling back to
    /// the empty-string key (list replies carry no session id).
    fn resolve_pending(&self, frame: IpcFrame) {
        let waiter = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending
                .remove(&frame.session_id)
                .or_else(|| pending.remove(""))
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => debug!(kind = ?frame.kind, session_id = %frame.session_id, "reply with no waiter"),
        }
    }

    fn cancel_pendings(&self) {
        self.pending.lock().expect("pending map poisoned").clear();
    }

    async fn heartbeat(self: Arc<Self>, writer: IpcWriter) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.is_connected() {
                break;
            }
            let ping = IpcFrame::empty(IpcMessageType::Heartbeat, "");
            if writer.write_frame(&ping).await.is_err() {
                break;
            }
        }
    }

    /// Create a session on the host. The generated request id travels in the
    /// frame's session-id field and comes back on the reply.
    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> WmxResult<SessionSnapshot> {
        let request_id = wmx_session::generate_id(4);
        let frame = IpcFrame::new(
            IpcMessageType::CreateSession,
            request_id.clone(),
            request.encode(),
        );
        let reply = self.request(&request_id, frame, self.timeouts.create).await?;
        match reply.kind {
            IpcMessageType::SessionCreated => SessionSnapshot::parse(&reply.payload),
            IpcMessageType::Error => Err(WmxError::Protocol(parse_error(&reply.payload))),
            other => Err(WmxError::Protocol(format!(
                "unexpected create reply: {other:?}"
            ))),
        }
    }

    pub async fn list_sessions(&self) -> WmxResult<Vec<SessionSnapshot>> {
        let frame = IpcFrame::empty(IpcMessageType::ListSessions, "");
        let reply = self.request("", frame, self.timeouts.list).await?;
        match reply.kind {
            IpcMessageType::SessionList => wmx_core::sidecar::parse_session_list(&reply.payload),
            IpcMessageType::Error => Err(WmxError::Protocol(parse_error(&reply.payload))),
            other => Err(WmxError::Protocol(format!(
                "unexpected list reply: {other:?}"
            ))),
        }
    }

    pub async fn get_buffer(&self, session_id: &str) -> WmxResult<Vec<u8>> {
        let frame = IpcFrame::empty(IpcMessageType::GetBuffer, session_id);
        let reply = self.request(session_id, frame, self.timeouts.buffer).await?;
        match reply.kind {
            IpcMessageType::Buffer => Ok(reply.payload),
            IpcMessageType::Error => Err(WmxError::Protocol(parse_error(&reply.payload))),
            other => Err(WmxError::Protocol(format!(
                "unexpected buffer reply: {other:?}"
            ))),
        }
    }

    pub async fn send_input(&self, session_id: &str, data: &[u8]) {
        let frame = IpcFrame::new(IpcMessageType::Input, session_id, data.to_vec());
        self.send_forgetting(&frame).await;
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let frame = IpcFrame::new(
            IpcMessageType::Resize,
            session_id,
            wmx_core::sidecar::encode_resize(cols, rows),
        );
        self.send_forgetting(&frame).await;
    }

    pub async fn close_session(&self, session_id: &str) {
        let frame = IpcFrame::empty(IpcMessageType::CloseSession, session_id);
        self.send_forgetting(&frame).await;
    }

    /// Ask the host process to shut down. Kills any surviving sessions.
    pub async fn shutdown(&self) {
        let frame = IpcFrame::empty(IpcMessageType::Shutdown, "");
        self.send_forgetting(&frame).await;
    }

    async fn request(
        &self,
        key: &str,
        frame: IpcFrame,
        timeout: Duration,
    ) -> WmxResult<IpcFrame> {
        if !self.is_connected() {
            return Err(WmxError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        // inserting under an existing key drops the old waiter, cancelling it
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(key.to_string(), tx);
        if let Err(e) = self.send(&frame).await {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(WmxError::Disconnected),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(key);
                Err(WmxError::Timeout)
            }
        }
    }

    async fn send(&self, frame: &IpcFrame) -> WmxResult<()> {
        let writer = self
            .writer
            .lock()
            .expect("writer lock poisoned")
            .clone();
        match writer {
            Some(writer) => writer.write_frame(frame).await,
            None => Err(WmxError::Disconnected),
        }
    }

    async fn send_forgetting(&self, frame: &IpcFrame) {
        if let Err(e) = self.send(frame).await {
            debug!(kind = ?frame.kind, error = %e, "fire-and-forget send failed");
        }
    }
}
