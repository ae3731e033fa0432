//! One browser connection's output buffering engine.
//!
//! Producers enqueue output chunks without ever blocking; a single processing
//! loop drains the queue into per-session buffers and decides what to flush.
//! The active session flushes every iteration; background sessions coalesce
//! until a byte threshold or a time interval. When the inbound queue
//! overflows, the oldest items are dropped and the client is told to resync.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use wmx_core::mux;

/// Engine knobs. Defaults are the production values; tests shrink them.
#[derive(Debug, Clone)]
pub struct MuxTuning {
    /// Inbound queue capacity in items; overflow drops the oldest.
    pub max_queued_items: usize,
    /// Per-session buffered byte cap; overflow drops the oldest chunks.
    pub buffer_cap: usize,
    /// Background sessions flush once this many bytes are buffered.
    pub flush_threshold: usize,
    /// Background sessions flush at least this often.
    pub flush_interval: Duration,
    /// Idle wakeup period of the processing loop.
    pub poll_interval: Duration,
}

impl Default for MuxTuning {
    fn default() -> Self {
        Self {
            max_queued_items: 1000,
            buffer_cap: 65_536,
            flush_threshold: 4096,
            flush_interval: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// One unit of session output headed for this connection.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
    pub data: Vec<u8>,
}

struct SessionBuffer {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    cols: u16,
    rows: u16,
    last_flush: Instant,
}

impl SessionBuffer {
    fn new(now: Instant) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            cols: 80,
            rows: 24,
            last_flush: now,
        }
    }
}

pub struct MuxConn {
    id: String,
    tuning: MuxTuning,
    queue: Mutex<VecDeque<OutputChunk>>,
    dropped: AtomicU64,
    removals: Mutex<Vec<String>>,
    active: Mutex<Option<String>>,
    notify: Notify,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MuxConn {
    /// Create the connection and start its processing loop. Encoded frames
    /// come out of `outbound` in flush order.
    pub fn start(
        id: String,
        tuning: MuxTuning,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            id,
            tuning,
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            removals: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            outbound,
        });
        let engine = conn.clone();
        tokio::spawn(async move { engine.run().await });
        conn
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Enqueue output. Never blocks; a full queue drops its oldest item and
    /// counts the drop for the next resync check.
    pub fn queue_output(&self, chunk: OutputChunk) {
        {
            let mut queue = self.queue.lock().expect("mux queue poisoned");
            while queue.len() >= self.tuning.max_queued_items {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::SeqCst);
            }
            queue.push_back(chunk);
        }
        self.notify.notify_one();
    }

    /// Switch flush priority to another session.
    pub fn set_active_session(&self, session_id: Option<String>) {
        *self.active.lock().expect("active session poisoned") = session_id;
        self.notify.notify_one();
    }

    pub fn active_session(&self) -> Option<String> {
        self.active.lock().expect("active session poisoned").clone()
    }

    /// Drop a closed session's queued and buffered output.
    pub fn remove_session(&self, session_id: &str) {
        self.queue
            .lock()
            .expect("mux queue poisoned")
            .retain(|chunk| chunk.session_id != session_id);
        self.removals
            .lock()
            .expect("removal list poisoned")
            .push(session_id.to_string());
        self.notify.notify_one();
    }

    /// Send a frame immediately, ordered with flushes through the same
    /// outbound path. Used for init, scrollback replay, and resync.
    pub fn send_now(&self, frame: Vec<u8>) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn run(&self) {
        let mut buffers: HashMap<String, SessionBuffer> = HashMap::new();
        loop {
            if self.is_closed() {
                break;
            }

            for session_id in self.removals.lock().expect("removal list poisoned").drain(..) {
                buffers.remove(&session_id);
            }

            let drained: Vec<OutputChunk> = {
                let mut queue = self.queue.lock().expect("mux queue poisoned");
                queue.drain(..).collect()
            };
            let now = Instant::now();
            for chunk in drained {
                let buffer = buffers
                    .entry(chunk.session_id)
                    .or_insert_with(|| SessionBuffer::new(now));
                buffer.cols = chunk.cols;
                buffer.rows = chunk.rows;
                buffer.bytes += chunk.data.len();
                buffer.chunks.push_back(chunk.data);
                while buffer.bytes > self.tuning.buffer_cap && buffer.chunks.len() > 1 {
                    if let Some(old) = buffer.chunks.pop_front() {
                        buffer.bytes -= old.len();
                    }
                }
            }

            let drops = self.dropped.swap(0, Ordering::SeqCst);
            if drops > 0 {
                debug!(conn_id = %self.id, drops, "queue overflow, requesting resync");
                if !self.send_now(mux::encode_resync("")) {
                    break;
                }
            }

            let active = self.active_session();
            let mut dead = false;
            for (session_id, buffer) in buffers.iter_mut() {
                let is_active = active.as_deref() == Some(session_id.as_str());
                let due = is_active
                    || buffer.bytes >= self.tuning.flush_threshold
                    || buffer.last_flush.elapsed() >= self.tuning.flush_interval;
                if !due {
                    continue;
                }
                if !buffer.chunks.is_empty() {
                    let mut data = Vec::with_capacity(buffer.bytes);
                    for chunk in &buffer.chunks {
                        data.extend_from_slice(chunk);
                    }
                    trace!(conn_id = %self.id, session_id = %session_id, bytes = data.len(), "flush");
                    let frame = mux::encode_output(session_id, buffer.cols, buffer.rows, &data);
                    if !self.send_now(frame) {
                        dead = true;
                        break;
                    }
                    buffer.chunks.clear();
                    buffer.bytes = 0;
                }
                buffer.last_flush = Instant::now();
            }
            if dead {
                break;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.tuning.poll_interval) => {}
            }
        }
        // a dead outbound ends the loop too; make sure the manager's sweep
        // sees this connection as closed
        self.closed.store(true, Ordering::SeqCst);
        debug!(conn_id = %self.id, "mux engine stopped");
    }
}
