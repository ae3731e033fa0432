//! The sidecar host: serves the session registry to front-end processes over
//! the framed IPC transport.
//!
//! One accept loop, one read loop per client. Registry output and state
//! events are broadcast to every connected client through a per-client
//! outbound queue with its own writer task; a stalled or failing client is
//! dropped from the queue map and never holds up the others.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use wmx_core::sidecar::{
    self, encode_session_list, parse_handshake, parse_resize, IpcMessageType,
};
use wmx_core::{
    CreateSessionRequest, IpcFrame, IpcListener, IpcTransport, IpcWriter, WmxResult,
    PROTOCOL_VERSION,
};
use wmx_session::{CreateSession, RunAs, SessionRegistry, ShellKind};

pub struct HostServer {
    registry: Arc<SessionRegistry>,
    secret: Option<String>,
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<IpcFrame>>>,
    next_client: AtomicU64,
    shutdown: Notify,
}

impl HostServer {
    pub fn new(registry: Arc<SessionRegistry>, secret: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            secret: secret.filter(|s| !s.is_empty()),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            shutdown: Notify::new(),
        })
    }

    /// Serve until a Shutdown frame arrives. Spawns the registry event
    /// bridges, then accepts clients.
    pub async fn run(self: &Arc<Self>, listener: IpcListener) -> WmxResult<()> {
        info!(endpoint = %listener.endpoint(), "host listening");
        self.spawn_event_bridges();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok(transport) => {
                            let server = self.clone();
                            tokio::spawn(async move { server.serve_client(transport).await });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.registry.close_all().await;
        Ok(())
    }

    /// Forward registry events to every connected client.
    fn spawn_event_bridges(self: &Arc<Self>) {
        let (_output_listener, mut output_rx) = self.registry.add_output_listener();
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(event) = output_rx.recv().await {
                // PTY reads are 8 KiB, but a frame payload is capped at the
                // u16 length field; chunk anything larger.
                for chunk in event.data.chunks(sidecar::MAX_PAYLOAD_SIZE) {
                    let frame = IpcFrame::new(
                        IpcMessageType::Output,
                        event.session_id.clone(),
                        chunk.to_vec(),
                    );
                    server.broadcast(&frame);
                }
            }
        });

        let (_state_listener, mut state_rx) = self.registry.add_state_listener();
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = state_rx.recv().await {
                let frame = IpcFrame::new(
                    IpcMessageType::StateChange,
                    snapshot.id.clone(),
                    snapshot.encode(),
                );
                server.broadcast(&frame);
            }
        });
    }

    /// Queue a frame to every client. Enqueueing never blocks; a client
    /// whose queue is gone is dropped here, a client whose write fails is
    /// dropped by its writer task.
    fn broadcast(&self, frame: &IpcFrame) {
        self.clients
            .lock()
            .expect("client map poisoned")
            .retain(|client_id, queue| {
                let alive = queue.send(frame.clone()).is_ok();
                if !alive {
                    debug!(client_id = *client_id, "dropping client with closed queue");
                }
                alive
            });
    }

    async fn serve_client(self: &Arc<Self>, mut transport: IpcTransport) {
        let client_id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let writer = transport.writer();

        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<IpcFrame>();
        self.clients
            .lock()
            .expect("client map poisoned")
            .insert(client_id, queue_tx);
        let outbound = writer.clone();
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = queue_rx.recv().await {
                if outbound.write_frame(&frame).await.is_err() {
                    debug!(client_id, "dropping client after failed broadcast");
                    server
                        .clients
                        .lock()
                        .expect("client map poisoned")
                        .remove(&client_id);
                    break;
                }
            }
        });
        info!(client_id, "client connected");

        loop {
            match transport.read_frame().await {
                Ok(Some(frame)) => self.dispatch(client_id, &writer, frame).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(client_id, error = %e, "client stream error");
                    break;
                }
            }
        }

        self.clients
            .lock()
            .expect("client map poisoned")
            .remove(&client_id);
        info!(client_id, "client disconnected");
    }

    async fn dispatch(&self, client_id: u64, writer: &IpcWriter, frame: IpcFrame) {
        match frame.kind {
            IpcMessageType::Handshake => {
                self.handle_handshake(client_id, writer, &frame).await;
            }
            IpcMessageType::CreateSession => {
                self.handle_create(writer, &frame).await;
            }
            IpcMessageType::CloseSession => {
                self.registry.close_session(&frame.session_id).await;
            }
            IpcMessageType::Input => {
                self.registry.send_input(&frame.session_id, &frame.payload).await;
            }
            IpcMessageType::Resize => {
                let (cols, rows) = parse_resize(&frame.payload);
                if let Err(e) = self.registry.resize_session(&frame.session_id, cols, rows).await {
                    debug!(session_id = %frame.session_id, error = %e, "resize failed");
                }
            }
            IpcMessageType::ListSessions => {
                let sessions = self.registry.session_list().await;
                let reply = IpcFrame::new(
                    IpcMessageType::SessionList,
                    frame.session_id.clone(),
                    encode_session_list(&sessions),
                );
                self.send_or_log(writer, &reply).await;
            }
            IpcMessageType::GetBuffer => {
                // no reply for unknown ids; the caller times out
                if self.registry.get(&frame.session_id).await.is_some() {
                    let buffer = self.registry.buffer(&frame.session_id).await;
                    let truncated = tail_within_frame(&buffer);
                    let reply = IpcFrame::new(
                        IpcMessageType::Buffer,
                        frame.session_id.clone(),
                        truncated,
                    );
                    self.send_or_log(writer, &reply).await;
                }
            }
            IpcMessageType::Heartbeat => {
                let reply = IpcFrame::empty(IpcMessageType::Heartbeat, frame.session_id.clone());
                self.send_or_log(writer, &reply).await;
            }
            IpcMessageType::Shutdown => {
                info!(client_id, "shutdown frame received");
                // notify_one stores a permit, so the request is not lost when
                // the accept loop is between polls
                self.shutdown.notify_one();
            }
            other => {
                debug!(client_id, kind = ?other, "ignoring unexpected frame");
            }
        }
    }

    async fn handle_handshake(&self, client_id: u64, writer: &IpcWriter, frame: &IpcFrame) {
        let (version, secret) = parse_handshake(&frame.payload);
        if version != PROTOCOL_VERSION {
            warn!(client_id, version, "handshake version mismatch");
            let reply = IpcFrame::new(
                IpcMessageType::Error,
                "",
                sidecar::encode_error(&format!(
                    "protocol version mismatch: client {version}, host {PROTOCOL_VERSION}"
                )),
            );
            self.send_or_log(writer, &reply).await;
            return;
        }
        if let Some(expected) = &self.secret {
            if &secret != expected {
                warn!(client_id, "handshake secret mismatch");
                let reply = IpcFrame::new(
                    IpcMessageType::Error,
                    "",
                    sidecar::encode_error("handshake rejected: bad secret"),
                );
                self.send_or_log(writer, &reply).await;
                return;
            }
        }
        let reply = IpcFrame::new(
            IpcMessageType::HandshakeAck,
            "",
            sidecar::encode_handshake(PROTOCOL_VERSION, ""),
        );
        self.send_or_log(writer, &reply).await;
        debug!(client_id, "handshake complete");
    }

    /// The session-id field of a CreateSession frame carries the caller's
    /// correlation id; the reply echoes it so the caller can match the
    /// response, and the snapshot payload carries the real session id.
    async fn handle_create(&self, writer: &IpcWriter, frame: &IpcFrame) {
        let request_id = frame.session_id.clone();
        let result = match CreateSessionRequest::parse(&frame.payload) {
            Ok(request) => self.create_from_request(request).await,
            Err(e) => Err(e),
        };
        let reply = match result {
            Ok(snapshot) => IpcFrame::new(
                IpcMessageType::SessionCreated,
                request_id,
                snapshot.encode(),
            ),
            Err(e) => IpcFrame::new(
                IpcMessageType::Error,
                request_id,
                sidecar::encode_error(&e.to_string()),
            ),
        };
        self.send_or_log(writer, &reply).await;
    }

    async fn create_from_request(
        &self,
        request: CreateSessionRequest,
    ) -> WmxResult<wmx_core::SessionSnapshot> {
        let shell = match &request.shell_type {
            Some(name) => Some(ShellKind::from_str(name)?),
            None => None,
        };
        let run_as = RunAs {
            user: request.run_as_user.clone(),
            user_sid: request.run_as_user_sid.clone(),
            uid: request.run_as_uid,
            gid: request.run_as_gid,
        };
        self.registry
            .create_session(CreateSession {
                shell,
                working_directory: request.working_directory.clone().map(Into::into),
                cols: Some(request.cols),
                rows: Some(request.rows),
                run_as: run_as.is_set().then_some(run_as),
            })
            .await
    }

    async fn send_or_log(&self, writer: &IpcWriter, frame: &IpcFrame) {
        if let Err(e) = writer.write_frame(frame).await {
            debug!(kind = ?frame.kind, error = %e, "reply send failed");
        }
    }
}

/// Most recent scrollback slice that fits one frame, cut at a UTF-8 boundary.
fn tail_within_frame(buffer: &[u8]) -> Vec<u8> {
    if buffer.len() <= sidecar::MAX_PAYLOAD_SIZE {
        return buffer.to_vec();
    }
    let mut start = buffer.len() - sidecar::MAX_PAYLOAD_SIZE;
    while start < buffer.len() && (buffer[start] & 0xC0) == 0x80 {
        start += 1;
    }
    buffer[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wmx_core::sidecar::parse_session_list;
    use wmx_session::{PtyConnection, PtyFactory, RegistryConfig};

    struct IdlePty {
        running: std::sync::atomic::AtomicBool,
    }

    impl PtyConnection for IdlePty {
        fn pid(&self) -> Option<i32> {
            Some(99)
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn exit_code(&self) -> Option<i32> {
            None
        }

        fn read_output(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
            while self.is_running() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(0)
        }

        fn write_input(&self, _data: &[u8]) -> std::io::Result<()> {
            Ok(())
        }

        fn resize(&self, _cols: u16, _rows: u16) -> WmxResult<()> {
            Ok(())
        }

        fn kill(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn test_server(secret: Option<String>) -> Arc<HostServer> {
        let factory: PtyFactory = Arc::new(|_, _| {
            Ok(Arc::new(IdlePty {
                running: std::sync::atomic::AtomicBool::new(true),
            }) as Arc<dyn PtyConnection>)
        });
        let registry = SessionRegistry::with_factory(
            RegistryConfig {
                default_shell: Some(ShellKind::Sh),
                ..Default::default()
            },
            factory,
        );
        HostServer::new(registry, secret)
    }

    /// Wire a fake client to the server over an in-memory stream.
    fn connect(server: &Arc<HostServer>) -> IpcTransport {
        connect_with_capacity(server, 64 * 1024)
    }

    fn connect_with_capacity(server: &Arc<HostServer>, capacity: usize) -> IpcTransport {
        let (client_side, server_side) = tokio::io::duplex(capacity);
        let server = server.clone();
        tokio::spawn(async move {
            server
                .serve_client(IpcTransport::new(Box::new(server_side)))
                .await;
        });
        IpcTransport::new(Box::new(client_side))
    }

    async fn shake(client: &mut IpcTransport) {
        let hello = IpcFrame::new(
            IpcMessageType::Handshake,
            "",
            sidecar::encode_handshake(PROTOCOL_VERSION, ""),
        );
        client.writer().write_frame(&hello).await.unwrap();
        let ack = client.read_frame().await.unwrap().unwrap();
        assert_eq!(ack.kind, IpcMessageType::HandshakeAck);
    }

    #[tokio::test]
    async fn handshake_version_mismatch_yields_error() {
        let server = test_server(None);
        let mut client = connect(&server);

        let hello = IpcFrame::new(
            IpcMessageType::Handshake,
            "",
            sidecar::encode_handshake(42, ""),
        );
        client.writer().write_frame(&hello).await.unwrap();

        let reply = client.read_frame().await.unwrap().unwrap();
        assert_eq!(reply.kind, IpcMessageType::Error);
        assert!(sidecar::parse_error(&reply.payload).contains("version"));

        // connection stays usable
        shake(&mut client).await;
    }

    #[tokio::test]
    async fn bad_secret_rejected() {
        let server = test_server(Some("hunter2".into()));
        let mut client = connect(&server);

        let hello = IpcFrame::new(
            IpcMessageType::Handshake,
            "",
            sidecar::encode_handshake(PROTOCOL_VERSION, "wrong"),
        );
        client.writer().write_frame(&hello).await.unwrap();
        let reply = client.read_frame().await.unwrap().unwrap();
        assert_eq!(reply.kind, IpcMessageType::Error);
    }

    #[tokio::test]
    async fn create_then_list_round_trip() {
        let server = test_server(None);
        let mut client = connect(&server);
        shake(&mut client).await;

        let request = CreateSessionRequest {
            shell_type: Some("sh".into()),
            cols: 100,
            rows: 40,
            ..Default::default()
        };
        let create = IpcFrame::new(IpcMessageType::CreateSession, "req00001", request.encode());
        client.writer().write_frame(&create).await.unwrap();

        // skip the StateChange broadcast that create raises
        let created = loop {
            let frame = client.read_frame().await.unwrap().unwrap();
            if frame.kind == IpcMessageType::SessionCreated {
                break frame;
            }
            assert_eq!(frame.kind, IpcMessageType::StateChange);
        };
        assert_eq!(created.session_id, "req00001");
        let snapshot = wmx_core::SessionSnapshot::parse(&created.payload).unwrap();
        assert_eq!(snapshot.cols, 100);
        assert_eq!(snapshot.shell_type, "sh");

        let list = IpcFrame::empty(IpcMessageType::ListSessions, "");
        client.writer().write_frame(&list).await.unwrap();
        let reply = client.read_frame().await.unwrap().unwrap();
        assert_eq!(reply.kind, IpcMessageType::SessionList);
        let sessions = parse_session_list(&reply.payload).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, snapshot.id);

        server.registry.close_all().await;
    }

    #[tokio::test]
    async fn create_failure_echoes_request_id() {
        let server = test_server(None);
        let mut client = connect(&server);
        shake(&mut client).await;

        let request = CreateSessionRequest {
            shell_type: Some("tcsh".into()),
            ..Default::default()
        };
        let create = IpcFrame::new(IpcMessageType::CreateSession, "req00002", request.encode());
        client.writer().write_frame(&create).await.unwrap();

        let reply = client.read_frame().await.unwrap().unwrap();
        assert_eq!(reply.kind, IpcMessageType::Error);
        assert_eq!(reply.session_id, "req00002");
    }

    #[tokio::test]
    async fn heartbeat_echoes() {
        let server = test_server(None);
        let mut client = connect(&server);
        shake(&mut client).await;

        let ping = IpcFrame::empty(IpcMessageType::Heartbeat, "");
        client.writer().write_frame(&ping).await.unwrap();
        let reply = client.read_frame().await.unwrap().unwrap();
        assert_eq!(reply.kind, IpcMessageType::Heartbeat);
    }

    #[tokio::test]
    async fn get_buffer_unknown_session_has_no_reply() {
        let server = test_server(None);
        let mut client = connect(&server);
        shake(&mut client).await;

        let get = IpcFrame::empty(IpcMessageType::GetBuffer, "deadbeef");
        client.writer().write_frame(&get).await.unwrap();
        let ping = IpcFrame::empty(IpcMessageType::Heartbeat, "");
        client.writer().write_frame(&ping).await.unwrap();

        // the next reply is the heartbeat echo, not a Buffer
        let reply = client.read_frame().await.unwrap().unwrap();
        assert_eq!(reply.kind, IpcMessageType::Heartbeat);
    }

    #[test]
    fn buffer_tail_cuts_at_char_boundary() {
        let mut buffer = vec![b'a'; sidecar::MAX_PAYLOAD_SIZE - 1];
        buffer.extend_from_slice("日本".as_bytes());
        let tail = tail_within_frame(&buffer);
        assert!(tail.len() <= sidecar::MAX_PAYLOAD_SIZE);
        assert!(std::str::from_utf8(&tail).is_ok());
    }

    #[tokio::test]
    async fn state_change_broadcast_reaches_client() {
        let server = test_server(None);
        server.spawn_event_bridges();
        let mut client = connect(&server);
        shake(&mut client).await;

        server.registry.close_session("deadbeef").await;

        let frame = client.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.kind, IpcMessageType::StateChange);
        let snapshot = wmx_core::SessionSnapshot::parse(&frame.payload).unwrap();
        assert_eq!(snapshot.id, "deadbeef");
        assert!(snapshot.is_tombstone());
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_broadcasts_to_others() {
        let server = test_server(None);
        server.spawn_event_bridges();

        // tiny pipe; handshakes, then never reads again
        let mut stalled = connect_with_capacity(&server, 256);
        shake(&mut stalled).await;
        let mut healthy = connect(&server);
        shake(&mut healthy).await;

        for _ in 0..50 {
            server.registry.close_session("deadbeef").await;
        }

        // the stalled client's pipe fills after a handful of frames; the
        // healthy client must still see every broadcast
        for _ in 0..50 {
            let frame = tokio::time::timeout(Duration::from_secs(2), healthy.read_frame())
                .await
                .expect("broadcast stalled behind a slow client")
                .unwrap()
                .unwrap();
            assert_eq!(frame.kind, IpcMessageType::StateChange);
        }
    }

    #[tokio::test]
    async fn shutdown_frame_received_before_run_still_stops_it() {
        let server = test_server(None);
        let mut client = connect(&server);
        shake(&mut client).await;

        let bye = IpcFrame::empty(IpcMessageType::Shutdown, "");
        client.writer().write_frame(&bye).await.unwrap();
        // let the dispatch task record the shutdown before run() starts
        tokio::time::sleep(Duration::from_millis(50)).await;

        let path = std::env::temp_dir().join(format!("wmx-shutdown-test-{}.sock", std::process::id()));
        let endpoint = wmx_core::IpcEndpoint::at(path);
        let listener = IpcListener::bind(&endpoint).unwrap();
        tokio::time::timeout(Duration::from_secs(2), server.run(listener))
            .await
            .expect("run never observed the shutdown request")
            .unwrap();
    }
}
