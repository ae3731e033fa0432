//! wmx-session: terminal session layer.
//!
//! Bridges raw PTY byte streams into buffered, observable session state:
//! the PTY capability trait and its portable-pty implementation, shell
//! resolution, the per-session read pump with scrollback and OSC-7 tracking,
//! and the concurrent session registry with listener fan-out.

pub mod events;
pub mod pty;
pub mod registry;
pub mod scrollback;
pub mod session;
pub mod shell;

pub use events::{ListenerHub, OutputEvent, SessionEvents};
pub use pty::{open_pty, PtyConnection, RunAs, SpawnSpec};
pub use registry::{CreateSession, PtyFactory, RegistryConfig, SessionRegistry};
pub use session::TerminalSession;
pub use shell::{resolve_shell, ShellConfig, ShellKind};

/// Generate a random lowercase hex identifier of `bytes * 2` characters.
pub fn generate_id(bytes: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let raw: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    hex::encode(raw)
}
