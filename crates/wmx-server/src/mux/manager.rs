//! Registry of live mux connections and fan-out of session output.

use super::conn::{MuxConn, MuxTuning, OutputChunk};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

pub struct MuxConnectionManager {
    tuning: MuxTuning,
    conns: Mutex<HashMap<String, Arc<MuxConn>>>,
}

impl MuxConnectionManager {
    pub fn new(tuning: MuxTuning) -> Arc<Self> {
        Arc::new(Self {
            tuning,
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Register a new connection. Encoded frames for it arrive on the
    /// returned channel's sender, handed to the connection's writer task.
    pub fn register(&self, client_id: &str, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Arc<MuxConn> {
        let conn = MuxConn::start(client_id.to_string(), self.tuning.clone(), outbound);
        self.conns
            .lock()
            .expect("conn map poisoned")
            .insert(client_id.to_string(), conn.clone());
        debug!(client_id, "mux connection registered");
        conn
    }

    pub fn unregister(&self, client_id: &str) {
        let removed = self
            .conns
            .lock()
            .expect("conn map poisoned")
            .remove(client_id);
        if let Some(conn) = removed {
            conn.close();
            debug!(client_id, "mux connection unregistered");
        }
    }

    /// Queue one session's output on every connection. Closed connections
    /// are swept; a slow one only ever drops its own data.
    pub fn broadcast_output(&self, session_id: &str, cols: u16, rows: u16, data: &[u8]) {
        let mut conns = self.conns.lock().expect("conn map poisoned");
        conns.retain(|_, conn| !conn.is_closed());
        for conn in conns.values() {
            conn.queue_output(OutputChunk {
                session_id: session_id.to_string(),
                cols,
                rows,
                data: data.to_vec(),
            });
        }
    }

    /// Drop a closed session's output from every connection.
    pub fn drop_session(&self, session_id: &str) {
        let conns = self.conns.lock().expect("conn map poisoned");
        for conn in conns.values() {
            conn.remove_session(session_id);
        }
    }

    /// Flip the named connection's active session. Returns whether the
    /// connection exists.
    pub fn set_active(&self, client_id: &str, session_id: &str) -> bool {
        let conn = self
            .conns
            .lock()
            .expect("conn map poisoned")
            .get(client_id)
            .cloned();
        match conn {
            Some(conn) => {
                conn.set_active_session(Some(session_id.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().expect("conn map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wmx_core::mux::{self, MuxFrameKind};

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let manager = MuxConnectionManager::new(MuxTuning {
            flush_interval: std::time::Duration::from_millis(30),
            poll_interval: std::time::Duration::from_millis(10),
            ..Default::default()
        });
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        manager.register("client-a", tx_a);
        manager.register("client-b", tx_b);

        manager.broadcast_output("ab12cd34", 120, 30, b"data");

        for rx in [&mut rx_a, &mut rx_b] {
            let bytes = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let frame = mux::decode(&bytes).unwrap();
            assert_eq!(frame.kind, MuxFrameKind::Output);
            assert_eq!(frame.session_id, "ab12cd34");
        }
        manager.unregister("client-a");
        manager.unregister("client-b");
    }

    #[tokio::test]
    async fn closed_connections_are_swept() {
        let manager = MuxConnectionManager::new(MuxTuning::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = manager.register("client-a", tx);
        assert_eq!(manager.len(), 1);

        conn.close();
        manager.broadcast_output("ab12cd34", 80, 24, b"x");
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn set_active_targets_one_connection() {
        let manager = MuxConnectionManager::new(MuxTuning::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = manager.register("client-a", tx);

        assert!(manager.set_active("client-a", "ab12cd34"));
        assert_eq!(conn.active_session().as_deref(), Some("ab12cd34"));
        assert!(!manager.set_active("missing", "ab12cd34"));
        manager.unregister("client-a");
    }
}
