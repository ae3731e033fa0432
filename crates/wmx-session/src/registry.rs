//! Session registry: owns every live session, fans their events out to
//! registered listeners, and answers lookups.

use crate::events::{ListenerHub, OutputEvent, SessionEvents};
use crate::pty::{open_pty, PtyConnection, RunAs, SpawnSpec};
use crate::scrollback::DEFAULT_SCROLLBACK_CHARS;
use crate::session::TerminalSession;
use crate::shell::{resolve_shell, ShellConfig, ShellKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tracing::{info, warn};
use wmx_core::{SessionSnapshot, WmxError, WmxResult};

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

/// Registry-wide defaults applied when a create request leaves them out.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub default_shell: Option<ShellKind>,
    pub default_working_directory: Option<PathBuf>,
    pub scrollback_chars: Option<usize>,
    pub run_as: RunAs,
}

/// Parameters for one new session.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub shell: Option<ShellKind>,
    pub working_directory: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub run_as: Option<RunAs>,
}

/// Injection point for PTY creation; tests substitute in-memory fakes.
pub type PtyFactory =
    Arc<dyn Fn(&ShellConfig, &SpawnSpec) -> WmxResult<Arc<dyn PtyConnection>> + Send + Sync>;

struct SessionEntry {
    seq: u64,
    session: Arc<TerminalSession>,
}

pub struct SessionRegistry {
    config: RegistryConfig,
    factory: PtyFactory,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_seq: AtomicU64,
    output_hub: Arc<ListenerHub<OutputEvent>>,
    state_hub: Arc<ListenerHub<SessionSnapshot>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Self::with_factory(config, Arc::new(|shell, spec| open_pty(shell, spec)))
    }

    pub fn with_factory(config: RegistryConfig, factory: PtyFactory) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            sessions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            output_hub: Arc::new(ListenerHub::new()),
            state_hub: Arc::new(ListenerHub::new()),
        })
    }

    /// Spawn a new session and raise a state event for it.
    pub async fn create_session(&self, request: CreateSession) -> WmxResult<SessionSnapshot> {
        let shell = resolve_shell(request.shell, self.config.default_shell);
        let cols = request.cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS);
        let rows = request.rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS);
        let working_directory = self.resolve_cwd(request.working_directory);
        let run_as = request.run_as.unwrap_or_else(|| self.config.run_as.clone());

        let spec = SpawnSpec {
            working_directory,
            cols,
            rows,
            run_as,
        };
        let pty = (self.factory)(&shell, &spec)?;

        let output_hub = self.output_hub.clone();
        let state_hub = self.state_hub.clone();
        let events = SessionEvents {
            on_output: Arc::new(move |session_id, data| {
                output_hub.emit(&OutputEvent {
                    session_id: session_id.to_string(),
                    data: data.to_vec(),
                });
            }),
            on_state: Arc::new(move |snapshot| state_hub.emit(&snapshot)),
        };

        let scrollback = self
            .config
            .scrollback_chars
            .unwrap_or(DEFAULT_SCROLLBACK_CHARS);
        let session = TerminalSession::spawn(pty, shell.kind, cols, rows, scrollback, events);
        let snapshot = session.snapshot();

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.sessions.write().await.insert(
            session.id().to_string(),
            SessionEntry { seq, session },
        );

        info!(session_id = %snapshot.id, shell = %snapshot.shell_type, "session registered");
        self.state_hub.emit(&snapshot);
        Ok(snapshot)
    }

    /// Working directory chain: request, then configured default, then the
    /// user's home, then the process cwd.
    fn resolve_cwd(&self, requested: Option<PathBuf>) -> PathBuf {
        requested
            .or_else(|| self.config.default_working_directory.clone())
            .or_else(dirs::home_dir)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    pub async fn all_sessions(&self) -> Vec<Arc<TerminalSession>> {
        self.sessions
            .read()
            .await
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Snapshots of every session, oldest first. Ties on the creation
    /// timestamp break by registration order.
    pub async fn session_list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<(i64, u64, SessionSnapshot)> = sessions
            .values()
            .map(|entry| {
                let snapshot = entry.session.snapshot();
                (snapshot.created_at, entry.seq, snapshot)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        entries.into_iter().map(|(_, _, snapshot)| snapshot).collect()
    }

    /// Close and remove a session. Always emits a tombstone state event so
    /// observers drop the id, whether or not it was registered here.
    pub async fn close_session(&self, session_id: &str) {
        match self.sessions.write().await.remove(session_id) {
            Some(entry) => entry.session.close(),
            None => warn!(session_id, "close requested for unknown session"),
        }
        self.state_hub.emit(&SessionSnapshot::tombstone(session_id));
    }

    pub async fn resize_session(&self, session_id: &str, cols: u16, rows: u16) -> WmxResult<()> {
        match self.get(session_id).await {
            Some(session) => session.resize(cols, rows),
            None => Err(WmxError::SessionNotFound(session_id.to_string())),
        }
    }

    pub async fn rename_session(&self, session_id: &str, name: &str) -> WmxResult<()> {
        match self.get(session_id).await {
            Some(session) => {
                session.set_name(name);
                Ok(())
            }
            None => Err(WmxError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Route input to a session. Unknown ids are dropped silently; input is
    /// fire-and-forget end to end.
    pub async fn send_input(&self, session_id: &str, data: &[u8]) {
        if let Some(session) = self.get(session_id).await {
            session.send_input(data);
        }
    }

    /// Scrollback contents of a session, empty for unknown ids.
    pub async fn buffer(&self, session_id: &str) -> Vec<u8> {
        match self.get(session_id).await {
            Some(session) => session.buffer_bytes(),
            None => Vec::new(),
        }
    }

    pub fn add_output_listener(&self) -> (String, UnboundedReceiver<OutputEvent>) {
        self.output_hub.add()
    }

    pub fn remove_output_listener(&self, id: &str) -> bool {
        self.output_hub.remove(id)
    }

    pub fn add_state_listener(&self) -> (String, UnboundedReceiver<SessionSnapshot>) {
        self.state_hub.add()
    }

    pub fn remove_state_listener(&self, id: &str) -> bool {
        self.state_hub.remove(id)
    }

    /// Close every session. Used at shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in sessions {
            self.close_session(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32};
    use std::sync::Mutex;
    use std::time::Duration;

    struct IdlePty {
        pid: i32,
        running: AtomicBool,
        input: Mutex<Vec<u8>>,
    }

    impl IdlePty {
        fn new(pid: i32) -> Arc<Self> {
            Arc::new(Self {
                pid,
                running: AtomicBool::new(true),
                input: Mutex::new(Vec::new()),
            })
        }
    }

    impl PtyConnection for IdlePty {
        fn pid(&self) -> Option<i32> {
            Some(self.pid)
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn exit_code(&self) -> Option<i32> {
            if self.is_running() {
                None
            } else {
                Some(0)
            }
        }

        fn read_output(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
            // block the pump until the session is killed
            while self.is_running() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(0)
        }

        fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
            self.input.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, _cols: u16, _rows: u16) -> WmxResult<()> {
            Ok(())
        }

        fn kill(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn fake_registry(config: RegistryConfig) -> (Arc<SessionRegistry>, Arc<Mutex<Vec<Arc<IdlePty>>>>) {
        let ptys: Arc<Mutex<Vec<Arc<IdlePty>>>> = Arc::new(Mutex::new(Vec::new()));
        let spawned = ptys.clone();
        let next_pid = AtomicI32::new(100);
        let factory: PtyFactory = Arc::new(move |_shell, _spec| {
            let pty = IdlePty::new(next_pid.fetch_add(1, Ordering::SeqCst));
            spawned.lock().unwrap().push(pty.clone());
            Ok(pty as Arc<dyn PtyConnection>)
        });
        (SessionRegistry::with_factory(config, factory), ptys)
    }

    #[tokio::test]
    async fn create_applies_defaults() {
        let (registry, _) = fake_registry(RegistryConfig {
            default_shell: Some(ShellKind::Bash),
            ..Default::default()
        });
        let snapshot = registry
            .create_session(CreateSession::default())
            .await
            .unwrap();

        assert_eq!(snapshot.shell_type, "bash");
        assert_eq!(snapshot.cols, DEFAULT_COLS);
        assert_eq!(snapshot.rows, DEFAULT_ROWS);
        assert_eq!(snapshot.id.len(), 8);
        assert!(snapshot.is_running);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn list_orders_by_creation() {
        let (registry, _) = fake_registry(RegistryConfig {
            default_shell: Some(ShellKind::Sh),
            ..Default::default()
        });
        let a = registry.create_session(CreateSession::default()).await.unwrap();
        let b = registry.create_session(CreateSession::default()).await.unwrap();
        let c = registry.create_session(CreateSession::default()).await.unwrap();

        let list = registry.session_list().await;
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn resize_one_of_two_sessions() {
        let (registry, _) = fake_registry(RegistryConfig {
            default_shell: Some(ShellKind::Sh),
            ..Default::default()
        });
        let a = registry.create_session(CreateSession::default()).await.unwrap();
        let b = registry.create_session(CreateSession::default()).await.unwrap();
        assert_ne!(a.id, b.id);

        registry.resize_session(&b.id, 80, 24).await.unwrap();

        let list = registry.session_list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a.id);
        assert_eq!((list[0].cols, list[0].rows), (DEFAULT_COLS, DEFAULT_ROWS));
        assert_eq!(list[1].id, b.id);
        assert_eq!((list[1].cols, list[1].rows), (80, 24));
        assert_ne!(list[0].pid, list[1].pid);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn close_unknown_emits_tombstone() {
        let (registry, _) = fake_registry(RegistryConfig {
            default_shell: Some(ShellKind::Sh),
            ..Default::default()
        });
        let (_listener, mut rx) = registry.add_state_listener();

        registry.close_session("deadbeef").await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, "deadbeef");
        assert!(event.is_tombstone());
        assert!(!event.is_running);
    }

    #[tokio::test]
    async fn close_removes_and_notifies() {
        let (registry, ptys) = fake_registry(RegistryConfig {
            default_shell: Some(ShellKind::Sh),
            ..Default::default()
        });
        let snapshot = registry.create_session(CreateSession::default()).await.unwrap();
        let (_listener, mut rx) = registry.add_state_listener();

        registry.close_session(&snapshot.id).await;

        assert!(registry.get(&snapshot.id).await.is_none());
        assert!(!ptys.lock().unwrap()[0].is_running());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, snapshot.id);
        assert!(event.is_tombstone());
    }

    #[tokio::test]
    async fn input_routes_to_session_and_unknown_is_dropped() {
        let (registry, ptys) = fake_registry(RegistryConfig {
            default_shell: Some(ShellKind::Sh),
            ..Default::default()
        });
        let snapshot = registry.create_session(CreateSession::default()).await.unwrap();

        registry.send_input(&snapshot.id, b"echo hi\r").await;
        registry.send_input("missing0", b"nope").await;

        assert_eq!(ptys.lock().unwrap()[0].input.lock().unwrap().as_slice(), b"echo hi\r");
        registry.close_all().await;
    }

    #[tokio::test]
    async fn resize_unknown_fails() {
        let (registry, _) = fake_registry(RegistryConfig::default());
        let result = registry.resize_session("missing0", 80, 24).await;
        assert!(matches!(result, Err(WmxError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn create_emits_state_event() {
        let (registry, _) = fake_registry(RegistryConfig {
            default_shell: Some(ShellKind::Sh),
            ..Default::default()
        });
        let (_listener, mut rx) = registry.add_state_listener();

        let snapshot = registry.create_session(CreateSession::default()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, snapshot.id);
        assert!(event.is_running);

        registry.close_all().await;
    }
}
