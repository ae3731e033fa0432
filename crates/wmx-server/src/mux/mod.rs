//! Per-connection output buffering and connection management for the
//! browser-facing mux protocol.

pub mod conn;
pub mod manager;

pub use conn::{MuxConn, MuxTuning, OutputChunk};
pub use manager::MuxConnectionManager;
