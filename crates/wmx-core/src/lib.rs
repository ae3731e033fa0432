//! wmx-core: Shared protocol library for wmx (web terminal multiplexer).
//!
//! Provides the two binary wire formats (browser mux protocol and
//! cross-process sidecar protocol), the structured payloads carried by the
//! sidecar protocol, the framed IPC transport over Unix domain sockets /
//! named pipes, and the common error type.

pub mod error;
pub mod ipc;
pub mod mux;
pub mod sidecar;
mod wire;

// Re-export commonly used items at crate root.
pub use error::{WmxError, WmxResult};
pub use ipc::{IpcEndpoint, IpcListener, IpcTransport, IpcWriter};
pub use sidecar::{
    CreateSessionRequest, IpcFrame, IpcMessageType, SessionSnapshot, PROTOCOL_VERSION,
};
