//! Cross-process sidecar protocol codec.
//!
//! Wire format: `[1 byte type][8 byte session id][2 byte LE length][payload]`.
//! The header is a fixed 11 bytes and the u16 length field bounds payloads at
//! 64 KiB; encoding a larger payload is a codec error.

use crate::error::{WmxError, WmxResult};
use crate::wire::{self, PayloadReader, PayloadWriter, SESSION_ID_LEN};
use serde::{Deserialize, Serialize};

/// Sidecar protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed sidecar frame header size.
pub const HEADER_SIZE: usize = 1 + SESSION_ID_LEN + 2;

/// Maximum payload bytes per frame (bounded by the u16 length field).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Message types of the sidecar protocol. Wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpcMessageType {
    Output = 0x01,
    Input = 0x02,
    Resize = 0x03,
    StateChange = 0x04,
    CreateSession = 0x10,
    SessionCreated = 0x11,
    CloseSession = 0x12,
    SessionClosed = 0x13,
    ListSessions = 0x14,
    SessionList = 0x15,
    GetBuffer = 0x16,
    Buffer = 0x17,
    Heartbeat = 0xF0,
    Handshake = 0xF1,
    HandshakeAck = 0xF2,
    Error = 0xFE,
    Shutdown = 0xFF,
}

impl TryFrom<u8> for IpcMessageType {
    type Error = WmxError;

    fn try_from(value: u8) -> WmxResult<Self> {
        match value {
            0x01 => Ok(Self::Output),
            0x02 => Ok(Self::Input),
            0x03 => Ok(Self::Resize),
            0x04 => Ok(Self::StateChange),
            0x10 => Ok(Self::CreateSession),
            0x11 => Ok(Self::SessionCreated),
            0x12 => Ok(Self::CloseSession),
            0x13 => Ok(Self::SessionClosed),
            0x14 => Ok(Self::ListSessions),
            0x15 => Ok(Self::SessionList),
            0x16 => Ok(Self::GetBuffer),
            0x17 => Ok(Self::Buffer),
            0xF0 => Ok(Self::Heartbeat),
            0xF1 => Ok(Self::Handshake),
            0xF2 => Ok(Self::HandshakeAck),
            0xFE => Ok(Self::Error),
            0xFF => Ok(Self::Shutdown),
            other => Err(WmxError::Codec(format!(
                "unknown sidecar message type {other:#04x}"
            ))),
        }
    }
}

/// One frame of the sidecar protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcFrame {
    pub kind: IpcMessageType,
    pub session_id: String,
    pub payload: Vec<u8>,
}

impl IpcFrame {
    pub fn new(kind: IpcMessageType, session_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            payload,
        }
    }

    /// A frame with no payload.
    pub fn empty(kind: IpcMessageType, session_id: impl Into<String>) -> Self {
        Self::new(kind, session_id, Vec::new())
    }
}

/// Serialize a frame, header plus payload.
pub fn encode(frame: &IpcFrame) -> WmxResult<Vec<u8>> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WmxError::Codec(format!(
            "payload too large: {} bytes (max {MAX_PAYLOAD_SIZE})",
            frame.payload.len()
        )));
    }
    let mut buf = vec![0u8; HEADER_SIZE + frame.payload.len()];
    buf[0] = frame.kind as u8;
    wire::write_session_id(&mut buf[1..1 + SESSION_ID_LEN], &frame.session_id);
    buf[9..11].copy_from_slice(&(frame.payload.len() as u16).to_le_bytes());
    buf[HEADER_SIZE..].copy_from_slice(&frame.payload);
    Ok(buf)
}

/// Parse an 11-byte header into (type, session id, payload length).
pub fn decode_header(header: &[u8]) -> WmxResult<(IpcMessageType, String, u16)> {
    if header.len() < HEADER_SIZE {
        return Err(WmxError::Codec(format!(
            "sidecar header too short: {} bytes, need {HEADER_SIZE}",
            header.len()
        )));
    }
    let kind = IpcMessageType::try_from(header[0])?;
    let session_id = wire::read_session_id(&header[1..1 + SESSION_ID_LEN]);
    let payload_len = u16::from_le_bytes([header[9], header[10]]);
    Ok((kind, session_id, payload_len))
}

/// Decode a complete frame from one buffer. Used by tests and by callers
/// that already hold the whole frame; the transport reads header and payload
/// separately via [`decode_header`].
pub fn decode(buf: &[u8]) -> WmxResult<IpcFrame> {
    let (kind, session_id, payload_len) = decode_header(buf)?;
    let end = HEADER_SIZE + payload_len as usize;
    if buf.len() < end {
        return Err(WmxError::Codec(format!(
            "sidecar frame truncated: have {} bytes, header claims {end}",
            buf.len()
        )));
    }
    Ok(IpcFrame {
        kind,
        session_id,
        payload: buf[HEADER_SIZE..end].to_vec(),
    })
}

// ── Structured payloads ────────────────────────────────────────────────

/// Request carried by a `CreateSession` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub shell_type: Option<String>,
    pub working_directory: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub run_as_user: Option<String>,
    pub run_as_user_sid: Option<String>,
    pub run_as_uid: Option<i32>,
    pub run_as_gid: Option<i32>,
}

impl CreateSessionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_str(self.shell_type.as_deref().unwrap_or(""));
        w.put_str(self.working_directory.as_deref().unwrap_or(""));
        w.put_u16(self.cols);
        w.put_u16(self.rows);
        w.put_str(self.run_as_user.as_deref().unwrap_or(""));
        w.put_str(self.run_as_user_sid.as_deref().unwrap_or(""));
        w.put_i32(self.run_as_uid.unwrap_or(-1));
        w.put_i32(self.run_as_gid.unwrap_or(-1));
        w.into_vec()
    }

    pub fn parse(payload: &[u8]) -> WmxResult<Self> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            shell_type: none_if_empty(r.get_str()?),
            working_directory: none_if_empty(r.get_str()?),
            cols: r.get_u16()?,
            rows: r.get_u16()?,
            run_as_user: none_if_empty(r.get_str()?),
            run_as_user_sid: none_if_empty(r.get_str()?),
            run_as_uid: none_if_negative(r.get_i32()?),
            run_as_gid: none_if_negative(r.get_i32()?),
        })
    }
}

/// Immutable, serializable projection of a terminal session.
///
/// Round-trips through the sidecar codec without loss, and serializes to
/// camelCase JSON for the front-end state channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub shell_type: String,
    pub is_running: bool,
    pub exit_code: Option<i32>,
    pub cols: u16,
    pub rows: u16,
    pub current_working_directory: Option<String>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub pid: Option<i32>,
}

impl SessionSnapshot {
    /// Marker for a session that no longer exists on the owning side.
    /// Receivers drop their entry instead of updating it.
    pub fn tombstone(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            shell_type: String::new(),
            is_running: false,
            exit_code: None,
            cols: 0,
            rows: 0,
            current_working_directory: None,
            created_at: 0,
            pid: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.shell_type.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        self.write_to(&mut w);
        w.into_vec()
    }

    pub fn parse(payload: &[u8]) -> WmxResult<Self> {
        let mut r = PayloadReader::new(payload);
        Self::read_from(&mut r)
    }

    fn write_to(&self, w: &mut PayloadWriter) {
        w.put_str(&self.id);
        w.put_str(self.name.as_deref().unwrap_or(""));
        w.put_str(&self.shell_type);
        w.put_bool(self.is_running);
        w.put_i32(self.exit_code.unwrap_or(-1));
        w.put_u16(self.cols);
        w.put_u16(self.rows);
        w.put_str(self.current_working_directory.as_deref().unwrap_or(""));
        w.put_i64(self.created_at);
        w.put_i32(self.pid.unwrap_or(-1));
    }

    fn read_from(r: &mut PayloadReader<'_>) -> WmxResult<Self> {
        Ok(Self {
            id: r.get_str()?,
            name: none_if_empty(r.get_str()?),
            shell_type: r.get_str()?,
            is_running: r.get_bool()?,
            exit_code: none_if_negative(r.get_i32()?),
            cols: r.get_u16()?,
            rows: r.get_u16()?,
            current_working_directory: none_if_empty(r.get_str()?),
            created_at: r.get_i64()?,
            pid: none_if_negative(r.get_i32()?),
        })
    }
}

/// Encode a `SessionList` payload: u16 count followed by that many snapshots.
pub fn encode_session_list(sessions: &[SessionSnapshot]) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_u16(sessions.len().min(u16::MAX as usize) as u16);
    for snapshot in sessions.iter().take(u16::MAX as usize) {
        snapshot.write_to(&mut w);
    }
    w.into_vec()
}

/// Parse a `SessionList` payload.
pub fn parse_session_list(payload: &[u8]) -> WmxResult<Vec<SessionSnapshot>> {
    let mut r = PayloadReader::new(payload);
    let count = r.get_u16()? as usize;
    let mut sessions = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        sessions.push(SessionSnapshot::read_from(&mut r)?);
    }
    Ok(sessions)
}

/// Encode a `Handshake`/`HandshakeAck` payload: u32 version + optional secret.
pub fn encode_handshake(version: u32, secret: &str) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_u32(version);
    w.put_bytes(secret.as_bytes());
    w.into_vec()
}

/// Parse a handshake payload. Short payloads parse as version 0, which never
/// matches [`PROTOCOL_VERSION`].
pub fn parse_handshake(payload: &[u8]) -> (u32, String) {
    let mut r = PayloadReader::new(payload);
    match r.get_u32() {
        Ok(version) => (version, String::from_utf8_lossy(r.rest()).into_owned()),
        Err(_) => (0, String::new()),
    }
}

/// Encode a `Resize` payload: u16 cols + u16 rows.
pub fn encode_resize(cols: u16, rows: u16) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.put_u16(cols);
    w.put_u16(rows);
    w.into_vec()
}

/// Parse a `Resize` payload. Short payloads fall back to 80×24.
pub fn parse_resize(payload: &[u8]) -> (u16, u16) {
    let mut r = PayloadReader::new(payload);
    match (r.get_u16(), r.get_u16()) {
        (Ok(cols), Ok(rows)) => (cols, rows),
        _ => (80, 24),
    }
}

/// Encode an `Error` payload: raw UTF-8 message.
pub fn encode_error(message: &str) -> Vec<u8> {
    message.as_bytes().to_vec()
}

/// Parse an `Error` (or `Buffer`) payload as UTF-8 text.
pub fn parse_error(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn none_if_negative(v: i32) -> Option<i32> {
    if v < 0 {
        None
    } else {
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> SessionSnapshot {
        SessionSnapshot {
            id: "ab12cd34".into(),
            name: Some("build".into()),
            shell_type: "bash".into(),
            is_running: true,
            exit_code: None,
            cols: 120,
            rows: 30,
            current_working_directory: Some("/home/test".into()),
            created_at: 1_700_000_000_000,
            pid: Some(4242),
        }
    }

    #[test]
    fn frame_round_trip_all_types() {
        let types = [
            IpcMessageType::Output,
            IpcMessageType::Input,
            IpcMessageType::Resize,
            IpcMessageType::StateChange,
            IpcMessageType::CreateSession,
            IpcMessageType::SessionCreated,
            IpcMessageType::CloseSession,
            IpcMessageType::SessionClosed,
            IpcMessageType::ListSessions,
            IpcMessageType::SessionList,
            IpcMessageType::GetBuffer,
            IpcMessageType::Buffer,
            IpcMessageType::Heartbeat,
            IpcMessageType::Handshake,
            IpcMessageType::HandshakeAck,
            IpcMessageType::Error,
            IpcMessageType::Shutdown,
        ];
        for kind in types {
            let frame = IpcFrame::new(kind, "ab12cd34", vec![1, 2, 3]);
            let bytes = encode(&frame).unwrap();
            assert_eq!(decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn empty_session_id_round_trips() {
        let frame = IpcFrame::empty(IpcMessageType::ListSessions, "");
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.session_id, "");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn max_payload_round_trips() {
        let frame = IpcFrame::new(IpcMessageType::Buffer, "ab12cd34", vec![0x41; MAX_PAYLOAD_SIZE]);
        let bytes = encode(&frame).unwrap();
        assert_eq!(decode(&bytes).unwrap().payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn oversize_payload_rejected() {
        let frame = IpcFrame::new(
            IpcMessageType::Buffer,
            "ab12cd34",
            vec![0; MAX_PAYLOAD_SIZE + 1],
        );
        assert!(encode(&frame).is_err());
    }

    #[test]
    fn short_header_rejected() {
        for len in 0..HEADER_SIZE {
            assert!(decode_header(&vec![0x01; len]).is_err());
        }
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = encode(&IpcFrame::empty(IpcMessageType::Heartbeat, "")).unwrap();
        bytes[0] = 0x7F;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn create_request_round_trip() {
        let request = CreateSessionRequest {
            shell_type: Some("zsh".into()),
            working_directory: Some("/tmp".into()),
            cols: 100,
            rows: 40,
            run_as_user: None,
            run_as_user_sid: None,
            run_as_uid: Some(1000),
            run_as_gid: Some(1000),
        };
        let parsed = CreateSessionRequest::parse(&request.encode()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn create_request_empty_strings_decode_unset() {
        let parsed = CreateSessionRequest::parse(&CreateSessionRequest::default().encode()).unwrap();
        assert_eq!(parsed.shell_type, None);
        assert_eq!(parsed.working_directory, None);
        assert_eq!(parsed.run_as_uid, None);
    }

    #[test]
    fn snapshot_round_trip() {
        let snapshot = sample_snapshot();
        assert_eq!(SessionSnapshot::parse(&snapshot.encode()).unwrap(), snapshot);
    }

    #[test]
    fn snapshot_optional_fields_round_trip() {
        let snapshot = SessionSnapshot {
            name: None,
            exit_code: Some(0),
            current_working_directory: None,
            pid: None,
            is_running: false,
            ..sample_snapshot()
        };
        let parsed = SessionSnapshot::parse(&snapshot.encode()).unwrap();
        // exit_code 0 must survive: only negative values mean "none"
        assert_eq!(parsed.exit_code, Some(0));
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn tombstone_detection() {
        let tombstone = SessionSnapshot::tombstone("ab12cd34");
        assert!(tombstone.is_tombstone());
        assert!(!sample_snapshot().is_tombstone());
        let parsed = SessionSnapshot::parse(&tombstone.encode()).unwrap();
        assert!(parsed.is_tombstone());
    }

    #[test]
    fn session_list_round_trip() {
        let sessions = vec![
            sample_snapshot(),
            SessionSnapshot {
                id: "ff00ff00".into(),
                ..sample_snapshot()
            },
        ];
        let parsed = parse_session_list(&encode_session_list(&sessions)).unwrap();
        assert_eq!(parsed, sessions);
    }

    #[test]
    fn empty_session_list_round_trip() {
        assert!(parse_session_list(&encode_session_list(&[])).unwrap().is_empty());
    }

    #[test]
    fn handshake_round_trip() {
        let payload = encode_handshake(PROTOCOL_VERSION, "hunter2");
        assert_eq!(parse_handshake(&payload), (PROTOCOL_VERSION, "hunter2".into()));
    }

    #[test]
    fn handshake_without_secret() {
        let payload = encode_handshake(PROTOCOL_VERSION, "");
        assert_eq!(parse_handshake(&payload), (PROTOCOL_VERSION, String::new()));
    }

    #[test]
    fn short_handshake_is_version_zero() {
        assert_eq!(parse_handshake(&[1, 0]), (0, String::new()));
    }

    #[test]
    fn resize_payload_round_trip() {
        assert_eq!(parse_resize(&encode_resize(132, 43)), (132, 43));
        assert_eq!(parse_resize(&[5]), (80, 24));
    }

    #[test]
    fn snapshot_json_is_camel_case() {
        let json = serde_json::to_string(&sample_snapshot()).unwrap();
        assert!(json.contains("\"shellType\":\"bash\""));
        assert!(json.contains("\"isRunning\":true"));
        assert!(json.contains("\"currentWorkingDirectory\""));
    }
}
