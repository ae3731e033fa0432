//! Framed IPC transport for the sidecar protocol.
//!
//! A transport wraps one connected byte stream (a Unix domain socket on
//! Unix, a named pipe on Windows) and reads/writes whole sidecar frames.
//! Reads loop until the exact byte count is obtained (partial reads are
//! normal for both pipe flavors); writes serialize whole frames under a
//! per-transport async mutex so concurrent callers never interleave frames.

use crate::error::{WmxError, WmxResult};
use crate::sidecar::{self, IpcFrame, HEADER_SIZE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Any connected byte stream the transport can frame over.
pub trait IpcStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IpcStream for T {}

/// Where the sidecar endpoint lives on this machine.
///
/// Windows uses the fixed pipe name `\\.\pipe\wmx-host`. Unix uses
/// `/tmp/wmx-host.sock` for root and `<home>/.wmx/host.sock` otherwise, so
/// unprivileged users do not fight over one world-writable path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcEndpoint {
    path: PathBuf,
}

impl IpcEndpoint {
    /// Resolve the default endpoint for this OS and user.
    pub fn resolve() -> Self {
        Self {
            path: default_endpoint_path(),
        }
    }

    /// Endpoint at an explicit path or pipe name (config override).
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Display for IpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(unix)]
fn default_endpoint_path() -> PathBuf {
    // Safety: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    if uid == 0 {
        PathBuf::from("/tmp/wmx-host.sock")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".wmx")
            .join("host.sock")
    }
}

#[cfg(windows)]
fn default_endpoint_path() -> PathBuf {
    PathBuf::from(r"\\.\pipe\wmx-host")
}

/// Cloneable writing half of a transport. Frame writes are serialized by an
/// async mutex; a frame is fully written and flushed before the lock drops.
#[derive(Clone)]
pub struct IpcWriter {
    inner: Arc<Mutex<WriteHalf<Box<dyn IpcStream>>>>,
}

impl IpcWriter {
    pub async fn write_frame(&self, frame: &IpcFrame) -> WmxResult<()> {
        let bytes = sidecar::encode(frame)?;
        let mut writer = self.inner.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| WmxError::Transport(format!("frame write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| WmxError::Transport(format!("frame flush failed: {e}")))?;
        Ok(())
    }
}

/// A connected, framed IPC byte stream.
pub struct IpcTransport {
    reader: ReadHalf<Box<dyn IpcStream>>,
    writer: IpcWriter,
}

impl IpcTransport {
    /// Wrap an already-connected stream. Used directly by tests (over an
    /// in-memory duplex) and by the listener's accept path.
    pub fn new(stream: Box<dyn IpcStream>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer: IpcWriter {
                inner: Arc::new(Mutex::new(writer)),
            },
        }
    }

    /// Connect to the sidecar endpoint.
    #[cfg(unix)]
    pub async fn connect(endpoint: &IpcEndpoint) -> WmxResult<Self> {
        let stream = tokio::net::UnixStream::connect(endpoint.path())
            .await
            .map_err(|e| {
                WmxError::Transport(format!("connect to {} failed: {e}", endpoint))
            })?;
        Ok(Self::new(Box::new(stream)))
    }

    /// Connect to the sidecar endpoint.
    #[cfg(windows)]
    pub async fn connect(endpoint: &IpcEndpoint) -> WmxResult<Self> {
        use tokio::net::windows::named_pipe::ClientOptions;
        let name = endpoint.path().to_string_lossy().into_owned();
        let pipe = ClientOptions::new()
            .open(&name)
            .map_err(|e| WmxError::Transport(format!("connect to {name} failed: {e}")))?;
        Ok(Self::new(Box::new(pipe)))
    }

    /// Clone a handle for writing frames from other tasks.
    pub fn writer(&self) -> IpcWriter {
        self.writer.clone()
    }

    /// Read the next frame. Returns `Ok(None)` on a clean end-of-stream
    /// before a header; an end-of-stream mid-frame is an error, because the
    /// stream is then desynchronized and must be discarded.
    pub async fn read_frame(&mut self) -> WmxResult<Option<IpcFrame>> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = self
                .reader
                .read(&mut header[filled..])
                .await
                .map_err(|e| WmxError::Transport(format!("header read failed: {e}")))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(WmxError::Transport(format!(
                    "stream closed mid-header ({filled}/{HEADER_SIZE} bytes)"
                )));
            }
            filled += n;
        }

        let (kind, session_id, payload_len) = sidecar::decode_header(&header)?;
        let mut payload = vec![0u8; payload_len as usize];
        if payload_len > 0 {
            self.reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| WmxError::Transport(format!("payload read failed: {e}")))?;
        }

        Ok(Some(IpcFrame {
            kind,
            session_id,
            payload,
        }))
    }
}

/// Bound server side of the IPC endpoint.
pub struct IpcListener {
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    endpoint: IpcEndpoint,
    #[cfg(windows)]
    first_instance: std::sync::atomic::AtomicBool,
}

impl IpcListener {
    /// Bind the endpoint. On Unix this creates the parent directory, deletes
    /// a stale socket file left by a previous run, and binds fresh.
    #[cfg(unix)]
    pub fn bind(endpoint: &IpcEndpoint) -> WmxResult<Self> {
        let path = endpoint.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WmxError::Transport(format!("create {} failed: {e}", parent.display())))?;
        }
        if path.exists() {
            debug!(path = %path.display(), "removing stale socket file");
            let _ = std::fs::remove_file(path);
        }
        let inner = tokio::net::UnixListener::bind(path)
            .map_err(|e| WmxError::Transport(format!("bind {} failed: {e}", path.display())))?;
        Ok(Self {
            inner,
            endpoint: endpoint.clone(),
        })
    }

    #[cfg(windows)]
    pub fn bind(endpoint: &IpcEndpoint) -> WmxResult<Self> {
        Ok(Self {
            endpoint: endpoint.clone(),
            first_instance: std::sync::atomic::AtomicBool::new(true),
        })
    }

    /// Accept the next client connection.
    #[cfg(unix)]
    pub async fn accept(&self) -> WmxResult<IpcTransport> {
        let (stream, _addr) = self
            .inner
            .accept()
            .await
            .map_err(|e| WmxError::Transport(format!("accept failed: {e}")))?;
        Ok(IpcTransport::new(Box::new(stream)))
    }

    /// Accept the next client connection. Named pipes accept by creating a
    /// fresh server instance per client; unboundedly many may be open.
    #[cfg(windows)]
    pub async fn accept(&self) -> WmxResult<IpcTransport> {
        use std::sync::atomic::Ordering;
        use tokio::net::windows::named_pipe::ServerOptions;
        let name = self.endpoint.path().to_string_lossy().into_owned();
        let first = self.first_instance.swap(false, Ordering::SeqCst);
        let server = ServerOptions::new()
            .first_pipe_instance(first)
            .create(&name)
            .map_err(|e| WmxError::Transport(format!("pipe create failed: {e}")))?;
        server
            .connect()
            .await
            .map_err(|e| WmxError::Transport(format!("pipe connect failed: {e}")))?;
        Ok(IpcTransport::new(Box::new(server)))
    }

    pub fn endpoint(&self) -> &IpcEndpoint {
        &self.endpoint
    }
}

#[cfg(unix)]
impl Drop for IpcListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.endpoint.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.endpoint, error = %e, "failed to remove socket file");
            }
        }
    }
}
