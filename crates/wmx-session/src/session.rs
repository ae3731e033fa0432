//! One live shell session.
//!
//! Owns a PTY connection, pumps its output into a capped scrollback buffer,
//! tracks the working directory reported through OSC-7 escape sequences, and
//! raises output/state notifications.

use crate::events::SessionEvents;
use crate::pty::PtyConnection;
use crate::scrollback::Scrollback;
use crate::shell::ShellKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use wmx_core::{SessionSnapshot, WmxResult};

/// Read size of the PTY pump.
const READ_CHUNK: usize = 8192;

struct SessionState {
    cols: u16,
    rows: u16,
    name: Option<String>,
    cwd: Option<String>,
    running: bool,
    exit_code: Option<i32>,
    scrollback: Scrollback,
}

pub struct TerminalSession {
    id: String,
    shell: ShellKind,
    created_at: i64,
    pty: Arc<dyn PtyConnection>,
    state: Mutex<SessionState>,
    events: SessionEvents,
    cancelled: AtomicBool,
    closed: AtomicBool,
}

impl TerminalSession {
    /// Start a session over an already-open PTY and begin pumping its
    /// output on a blocking task.
    pub fn spawn(
        pty: Arc<dyn PtyConnection>,
        shell: ShellKind,
        cols: u16,
        rows: u16,
        scrollback_chars: usize,
        events: SessionEvents,
    ) -> Arc<Self> {
        let id = crate::generate_id(4);
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let session = Arc::new(Self {
            id: id.clone(),
            shell,
            created_at,
            pty,
            state: Mutex::new(SessionState {
                cols,
                rows,
                name: None,
                cwd: None,
                running: true,
                exit_code: None,
                scrollback: Scrollback::new(scrollback_chars),
            }),
            events,
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let pump = session.clone();
        tokio::task::spawn_blocking(move || pump.read_pump());
        info!(session_id = %id, shell = %shell, "session started");
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell(&self) -> ShellKind {
        self.shell
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Blocking loop on the PTY output stream. Ends silently on
    /// cancellation, end-of-stream, or I/O error; a final state event fires
    /// when the pump ends so observers see the exit.
    fn read_pump(&self) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let n = match self.pty.read_output(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = &buf[..n];
            self.absorb_chunk(chunk);
            (self.events.on_output)(&self.id, chunk);
        }

        let exit_code = self.pty.exit_code();
        {
            let mut state = self.state.lock().expect("session state poisoned");
            state.running = false;
            state.exit_code = exit_code;
        }
        debug!(session_id = %self.id, exit_code = ?exit_code, "read pump ended");
        (self.events.on_state)(self.snapshot());
    }

    /// Append a chunk to the scrollback and scan it for an OSC-7 working
    /// directory report. Only a changed cwd raises a state event.
    fn absorb_chunk(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        let new_cwd = parse_osc7_path(&text);

        let changed = {
            let mut state = self.state.lock().expect("session state poisoned");
            state.scrollback.append(&text);
            match new_cwd {
                Some(path) if state.cwd.as_deref() != Some(path.as_str()) => {
                    state.cwd = Some(path);
                    true
                }
                _ => false,
            }
        };

        if changed {
            (self.events.on_state)(self.snapshot());
        }
    }

    /// Write keystrokes to the PTY. Failures are swallowed; the session may
    /// have just exited.
    pub fn send_input(&self, data: &[u8]) {
        if self.closed.load(Ordering::SeqCst) || data.is_empty() {
            return;
        }
        if let Err(e) = self.pty.write_input(data) {
            debug!(session_id = %self.id, error = %e, "PTY input write failed");
        }
    }

    /// Resize the terminal. Identical dimensions are a successful no-op and
    /// raise no state event.
    pub fn resize(&self, cols: u16, rows: u16) -> WmxResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if state.cols == cols && state.rows == rows {
                return Ok(());
            }
            state.cols = cols;
            state.rows = rows;
        }
        self.pty.resize(cols, rows)?;
        (self.events.on_state)(self.snapshot());
        Ok(())
    }

    /// Rename the session. Blank names clear it. Always raises a state
    /// event.
    pub fn set_name(&self, name: &str) {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            let trimmed = name.trim();
            state.name = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
        (self.events.on_state)(self.snapshot());
    }

    pub fn dimensions(&self) -> (u16, u16) {
        let state = self.state.lock().expect("session state poisoned");
        (state.cols, state.rows)
    }

    /// Current scrollback contents as UTF-8 bytes.
    pub fn buffer_bytes(&self) -> Vec<u8> {
        let state = self.state.lock().expect("session state poisoned");
        state.scrollback.contents().as_bytes().to_vec()
    }

    /// Stop the read pump and kill the PTY (process tree included).
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.pty.kill();
        let mut state = self.state.lock().expect("session state poisoned");
        state.running = false;
        info!(session_id = %self.id, "session closed");
    }

    /// Pure projection of the current state. No side effects.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().expect("session state poisoned");
        SessionSnapshot {
            id: self.id.clone(),
            name: state.name.clone(),
            shell_type: self.shell.to_string(),
            is_running: state.running && self.pty.is_running(),
            exit_code: state.exit_code.or_else(|| self.pty.exit_code()),
            cols: state.cols,
            rows: state.rows,
            current_working_directory: state.cwd.clone(),
            created_at: self.created_at,
            pid: self.pty.pid(),
        }
    }
}

/// Extract the working directory from the last OSC-7 sequence in `text`.
///
/// The sequence is `ESC ] 7 ; file://<host><path>` terminated by BEL or ESC.
/// The path is percent-decoded, and the leading separator is stripped when
/// it precedes a drive letter (`/C:/Users` → `C:/Users`).
pub fn parse_osc7_path(text: &str) -> Option<String> {
    let start = text.rfind("\x1b]7;")?;
    let uri_start = start + 4;
    let rest = &text[uri_start..];
    let end = rest.find(['\x07', '\x1b'])?;
    if end == 0 {
        return None;
    }
    let uri = &rest[..end];

    let lower = uri.get(..7)?;
    if !lower.eq_ignore_ascii_case("file://") {
        return None;
    }

    // skip the authority (host name) up to the first slash of the path
    let path_start = uri[7..].find('/')? + 7;
    let mut path = percent_decode(&uri[path_start..]);

    let bytes = path.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'/' && bytes[2] == b':' {
        path.remove(0);
    }
    Some(path)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// PTY fake: scripted output chunks, captured input, no real process.
    struct FakePty {
        output: Mutex<VecDeque<Vec<u8>>>,
        input: Mutex<Vec<u8>>,
        resizes: Mutex<Vec<(u16, u16)>>,
        running: AtomicBool,
    }

    impl FakePty {
        fn new(chunks: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                output: Mutex::new(chunks.into()),
                input: Mutex::new(Vec::new()),
                resizes: Mutex::new(Vec::new()),
                running: AtomicBool::new(true),
            })
        }
    }

    impl PtyConnection for FakePty {
        fn pid(&self) -> Option<i32> {
            Some(12345)
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

        fn read_output(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            let chunk = self.output.lock().unwrap().pop_front();
            match chunk {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => {
                    self.running.store(false, Ordering::SeqCst);
                    Ok(0)
                }
            }
        }

        fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
            self.input.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> WmxResult<()> {
            self.resizes.lock().unwrap().push((cols, rows));
            Ok(())
        }

        fn kill(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    async fn drain_pump(session: &TerminalSession) {
        // the pump runs on a blocking task; give it time to finish
        for _ in 0..50 {
            if !session.snapshot().is_running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("read pump did not finish");
    }

    #[test]
    fn osc7_extracts_windows_path() {
        let input = "\x1b]7;file://host/C:/Users/test\x07PS>";
        assert_eq!(parse_osc7_path(input).as_deref(), Some("C:/Users/test"));
    }

    #[test]
    fn osc7_esc_terminator_matches_bel() {
        let bel = parse_osc7_path("\x1b]7;file://host/C:/Users/test\x07");
        let esc = parse_osc7_path("\x1b]7;file://host/C:/Users/test\x1b\\");
        assert_eq!(bel, esc);
    }

    #[test]
    fn osc7_percent_decodes() {
        let input = "\x1b]7;file://localhost/C:/Program%20Files/App\x07";
        assert_eq!(parse_osc7_path(input).as_deref(), Some("C:/Program Files/App"));
    }

    #[test]
    fn osc7_unix_path_keeps_leading_slash() {
        let input = "\x1b]7;file://box/home/user/src\x07";
        assert_eq!(parse_osc7_path(input).as_deref(), Some("/home/user/src"));
    }

    #[test]
    fn osc7_embedded_in_output() {
        let input = "some output\x1b]7;file://host/E:/data\x07more output";
        assert_eq!(parse_osc7_path(input).as_deref(), Some("E:/data"));
    }

    #[test]
    fn osc7_absent_or_invalid() {
        assert_eq!(parse_osc7_path("plain prompt $ "), None);
        assert_eq!(parse_osc7_path("\x1b]7;not-a-file-uri\x07"), None);
        assert_eq!(parse_osc7_path("\x1b]7;\x07"), None);
    }

    #[tokio::test]
    async fn pump_buffers_output_and_tracks_cwd() {
        let pty = FakePty::new(vec![
            b"hello ".to_vec(),
            b"\x1b]7;file://host/C:/Users/test\x07world".to_vec(),
        ]);
        let session = TerminalSession::spawn(
            pty,
            ShellKind::Bash,
            120,
            30,
            1000,
            SessionEvents::discard(),
        );
        drain_pump(&session).await;

        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.current_working_directory.as_deref(),
            Some("C:/Users/test")
        );
        let buffer = String::from_utf8(session.buffer_bytes()).unwrap();
        assert!(buffer.starts_with("hello "));
        assert!(buffer.ends_with("world"));
    }

    #[tokio::test]
    async fn unchanged_cwd_raises_no_extra_state_event() {
        let cwd_chunk = b"\x1b]7;file://host/C:/Users/test\x07".to_vec();
        let pty = FakePty::new(vec![cwd_chunk.clone(), cwd_chunk]);
        let state_events = Arc::new(AtomicUsize::new(0));
        let counter = state_events.clone();
        let events = SessionEvents {
            on_output: Arc::new(|_, _| {}),
            on_state: Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let session = TerminalSession::spawn(pty, ShellKind::Bash, 120, 30, 1000, events);
        drain_pump(&session).await;

        // one for the cwd change, one for pump end; not one per chunk
        assert_eq!(state_events.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resize_is_idempotent() {
        let pty = FakePty::new(vec![]);
        let state_events = Arc::new(AtomicUsize::new(0));
        let counter = state_events.clone();
        let events = SessionEvents {
            on_output: Arc::new(|_, _| {}),
            on_state: Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let session = TerminalSession::spawn(pty.clone(), ShellKind::Bash, 120, 30, 1000, events);
        drain_pump(&session).await;
        let baseline = state_events.load(Ordering::SeqCst);

        session.resize(80, 24).unwrap();
        session.resize(80, 24).unwrap();

        assert_eq!(session.dimensions(), (80, 24));
        // second call with identical dims must not raise a second event
        assert_eq!(state_events.load(Ordering::SeqCst), baseline + 1);
        assert_eq!(pty.resizes.lock().unwrap().as_slice(), &[(80, 24)]);
    }

    #[tokio::test]
    async fn input_reaches_pty_and_failures_are_swallowed() {
        let pty = FakePty::new(vec![]);
        let session = TerminalSession::spawn(
            pty.clone(),
            ShellKind::Zsh,
            120,
            30,
            1000,
            SessionEvents::discard(),
        );
        session.send_input(b"ls\r");
        assert_eq!(pty.input.lock().unwrap().as_slice(), b"ls\r");

        session.close();
        session.send_input(b"ignored");
        assert_eq!(pty.input.lock().unwrap().as_slice(), b"ls\r");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_kills_pty() {
        let pty = FakePty::new(vec![]);
        let session = TerminalSession::spawn(
            pty.clone(),
            ShellKind::Sh,
            80,
            24,
            1000,
            SessionEvents::discard(),
        );
        session.close();
        session.close();
        assert!(!pty.is_running());
        assert!(!session.snapshot().is_running);
    }

    #[tokio::test]
    async fn rename_trims_and_clears() {
        let pty = FakePty::new(vec![]);
        let session = TerminalSession::spawn(
            pty,
            ShellKind::Bash,
            80,
            24,
            1000,
            SessionEvents::discard(),
        );
        session.set_name("  build  ");
        assert_eq!(session.snapshot().name.as_deref(), Some("build"));
        session.set_name("   ");
        assert_eq!(session.snapshot().name, None);
    }
}
