//! Front-end mirror of session state.
//!
//! Updated from registry events in standalone mode and from StateChange
//! frames in sidecar mode. Tombstone snapshots remove their entry; anything
//! else upserts.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use wmx_core::SessionSnapshot;

#[derive(Default)]
pub struct SnapshotStore {
    inner: Mutex<HashMap<String, SessionSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one state event. Tombstones remove the entry.
    pub fn apply(&self, snapshot: SessionSnapshot) {
        let mut map = self.inner.lock().expect("snapshot map poisoned");
        if snapshot.is_tombstone() {
            map.remove(&snapshot.id);
        } else {
            map.insert(snapshot.id.clone(), snapshot);
        }
    }

    /// Replace the whole store, for seeding from a session list.
    pub fn replace_all(&self, sessions: Vec<SessionSnapshot>) {
        let mut map = self.inner.lock().expect("snapshot map poisoned");
        map.clear();
        for snapshot in sessions {
            map.insert(snapshot.id.clone(), snapshot);
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.inner
            .lock()
            .expect("snapshot map poisoned")
            .get(session_id)
            .cloned()
    }

    /// Latest known dimensions for a session, 80×24 when unknown.
    pub fn dims(&self, session_id: &str) -> (u16, u16) {
        self.get(session_id)
            .map(|s| (s.cols, s.rows))
            .unwrap_or((80, 24))
    }

    /// All snapshots, oldest first; ties on the timestamp break by id.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let map = self.inner.lock().expect("snapshot map poisoned");
        let mut sessions: Vec<SessionSnapshot> = map.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// The `/ws/state` push payload.
    pub fn to_json(&self) -> String {
        json!({ "sessions": self.list() }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, created_at: i64) -> SessionSnapshot {
        SessionSnapshot {
            id: id.into(),
            name: None,
            shell_type: "bash".into(),
            is_running: true,
            exit_code: None,
            cols: 120,
            rows: 30,
            current_working_directory: None,
            created_at,
            pid: Some(1),
        }
    }

    #[test]
    fn upsert_and_order() {
        let store = SnapshotStore::new();
        store.apply(snapshot("bbbbbbbb", 200));
        store.apply(snapshot("aaaaaaaa", 100));
        store.apply(snapshot("cccccccc", 200));

        let ids: Vec<String> = store.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["aaaaaaaa", "bbbbbbbb", "cccccccc"]);
    }

    #[test]
    fn tombstone_removes() {
        let store = SnapshotStore::new();
        store.apply(snapshot("aaaaaaaa", 100));
        assert!(store.get("aaaaaaaa").is_some());

        store.apply(SessionSnapshot::tombstone("aaaaaaaa"));
        assert!(store.get("aaaaaaaa").is_none());
        assert!(store.list().is_empty());
    }

    #[test]
    fn dims_fall_back() {
        let store = SnapshotStore::new();
        store.apply(snapshot("aaaaaaaa", 100));
        assert_eq!(store.dims("aaaaaaaa"), (120, 30));
        assert_eq!(store.dims("missing0"), (80, 24));
    }

    #[test]
    fn json_shape() {
        let store = SnapshotStore::new();
        store.apply(snapshot("aaaaaaaa", 100));
        let json = store.to_json();
        assert!(json.starts_with("{\"sessions\":["));
        assert!(json.contains("\"shellType\":\"bash\""));
        assert!(json.contains("\"createdAt\":100"));
    }
}
