//! PTY capability interface and its portable-pty implementation.
//!
//! The session layer only consumes this surface; process-spawning mechanics
//! and OS handle types stay behind it. Reads and writes are blocking and are
//! driven from `spawn_blocking` contexts by the session read pump.

use crate::shell::ShellConfig;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use wmx_core::{WmxError, WmxResult};

/// What the core needs from a live PTY. Implemented per OS by portable-pty;
/// tests substitute in-memory fakes.
pub trait PtyConnection: Send + Sync {
    /// Process id of the shell, if known.
    fn pid(&self) -> Option<i32>;
    /// Whether the child is still running.
    fn is_running(&self) -> bool;
    /// Exit code once the child has exited.
    fn exit_code(&self) -> Option<i32>;
    /// Blocking read from the PTY output stream. 0 = end of stream.
    fn read_output(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    /// Blocking write to the PTY input stream.
    fn write_input(&self, data: &[u8]) -> std::io::Result<()>;
    /// Resize the terminal.
    fn resize(&self, cols: u16, rows: u16) -> WmxResult<()>;
    /// Kill the child process tree. Idempotent.
    fn kill(&self);
}

/// De-elevation parameters: run the shell as another user. Passed through to
/// the PTY collaborator; which fields apply is per-OS (sid on Windows,
/// uid/gid on Unix).
#[derive(Debug, Clone, Default)]
pub struct RunAs {
    pub user: Option<String>,
    pub user_sid: Option<String>,
    pub uid: Option<i32>,
    pub gid: Option<i32>,
}

impl RunAs {
    pub fn is_set(&self) -> bool {
        self.user.is_some() || self.uid.is_some()
    }
}

/// Everything needed to start a shell besides the shell itself.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub working_directory: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub run_as: RunAs,
}

/// Open a PTY running the given shell.
pub fn open_pty(shell: &ShellConfig, spec: &SpawnSpec) -> WmxResult<Arc<dyn PtyConnection>> {
    Ok(Arc::new(PortablePty::spawn(shell, spec)?))
}

/// PTY backed by the portable-pty crate.
pub struct PortablePty {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_code: Mutex<Option<i32>>,
    pid: Option<i32>,
}

impl PortablePty {
    pub fn spawn(shell: &ShellConfig, spec: &SpawnSpec) -> WmxResult<Self> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| WmxError::Other(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&shell.program);
        for arg in &shell.args {
            cmd.arg(arg);
        }
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }
        cmd.cwd(&spec.working_directory);

        if spec.run_as.is_set() {
            // Running as another user is the concern of a dedicated host
            // build; the portable backend spawns as the current user.
            debug!(user = ?spec.run_as.user, uid = ?spec.run_as.uid, "run-as requested, portable backend spawns as current user");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| WmxError::Other(format!("failed to spawn shell: {e}")))?;

        let pid = child.process_id().map(|p| p as i32);
        info!(shell = %shell.kind, pid = ?pid, cols = spec.cols, rows = spec.rows, "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WmxError::Other(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WmxError::Other(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            exit_code: Mutex::new(None),
            pid,
        })
    }

    /// Poll the child once, caching the exit code when it has exited.
    fn poll_exit(&self) -> Option<i32> {
        {
            let cached = self.exit_code.lock().expect("exit code lock poisoned");
            if cached.is_some() {
                return *cached;
            }
        }
        let mut child = self.child.lock().expect("child lock poisoned");
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.exit_code() as i32;
                *self.exit_code.lock().expect("exit code lock poisoned") = Some(code);
                Some(code)
            }
            _ => None,
        }
    }
}

impl PtyConnection for PortablePty {
    fn pid(&self) -> Option<i32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.poll_exit().is_none()
    }

    fn exit_code(&self) -> Option<i32> {
        self.poll_exit()
    }

    fn read_output(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut reader = self.reader.lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "PTY reader lock poisoned")
        })?;
        reader.read(buf)
    }

    fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "PTY writer lock poisoned")
        })?;
        writer.write_all(data)?;
        writer.flush()
    }

    fn resize(&self, cols: u16, rows: u16) -> WmxResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| WmxError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| WmxError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, pid = ?self.pid, "PTY resized");
        Ok(())
    }

    fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }
}
