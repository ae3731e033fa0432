//! Browser-facing mux protocol codec.
//!
//! Wire format: `[1 byte type][8 byte session id][payload]`, carried verbatim
//! inside WebSocket binary messages (the WS message is the frame boundary).
//!
//! Output frames embed the terminal dimensions ahead of the raw bytes so a
//! client can resize its view before rendering stale-dimension data:
//! `[cols u16 LE][rows u16 LE][data]`.

use crate::error::{WmxError, WmxResult};
use crate::wire::{self, SESSION_ID_LEN};

/// Fixed mux frame header: type byte + session id field.
pub const MUX_HEADER_LEN: usize = 1 + SESSION_ID_LEN;

/// Frame types of the mux protocol. Wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxFrameKind {
    /// Server → client: cols + rows + raw terminal bytes.
    Output = 0x01,
    /// Client → server: raw keystrokes.
    Input = 0x02,
    /// Client → server: 4-byte cols + rows.
    Resize = 0x03,
    /// Server → client: discard all rendered terminal state, a fresh full
    /// buffer follows.
    Resync = 0x05,
    /// Server → client, once per connection: the session id field carries the
    /// first 8 chars of the client id, the payload the full client id.
    Init = 0xFF,
}

impl TryFrom<u8> for MuxFrameKind {
    type Error = WmxError;

    fn try_from(value: u8) -> WmxResult<Self> {
        match value {
            0x01 => Ok(Self::Output),
            0x02 => Ok(Self::Input),
            0x03 => Ok(Self::Resize),
            0x05 => Ok(Self::Resync),
            0xFF => Ok(Self::Init),
            other => Err(WmxError::Codec(format!("unknown mux frame type {other:#04x}"))),
        }
    }
}

/// A decoded mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub kind: MuxFrameKind,
    pub session_id: String,
    pub payload: Vec<u8>,
}

/// Encode a frame of any type with an opaque payload.
pub fn encode(kind: MuxFrameKind, session_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; MUX_HEADER_LEN + payload.len()];
    buf[0] = kind as u8;
    wire::write_session_id(&mut buf[1..MUX_HEADER_LEN], session_id);
    buf[MUX_HEADER_LEN..].copy_from_slice(payload);
    buf
}

/// Encode an output frame: dimensions followed by raw terminal bytes.
pub fn encode_output(session_id: &str, cols: u16, rows: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; MUX_HEADER_LEN + 4 + data.len()];
    buf[0] = MuxFrameKind::Output as u8;
    wire::write_session_id(&mut buf[1..MUX_HEADER_LEN], session_id);
    buf[MUX_HEADER_LEN..MUX_HEADER_LEN + 2].copy_from_slice(&cols.to_le_bytes());
    buf[MUX_HEADER_LEN + 2..MUX_HEADER_LEN + 4].copy_from_slice(&rows.to_le_bytes());
    buf[MUX_HEADER_LEN + 4..].copy_from_slice(data);
    buf
}

/// Encode a resize frame (exactly 4 payload bytes).
pub fn encode_resize(session_id: &str, cols: u16, rows: u16) -> Vec<u8> {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&cols.to_le_bytes());
    payload[2..].copy_from_slice(&rows.to_le_bytes());
    encode(MuxFrameKind::Resize, session_id, &payload)
}

/// Encode a resync frame. An empty session id tells the client to clear
/// every terminal.
pub fn encode_resync(session_id: &str) -> Vec<u8> {
    encode(MuxFrameKind::Resync, session_id, &[])
}

/// Encode the per-connection init frame carrying the client's own id.
pub fn encode_init(client_id: &str) -> Vec<u8> {
    encode(MuxFrameKind::Init, client_id, client_id.as_bytes())
}

/// Decode a complete mux frame. Buffers shorter than the 9-byte header and
/// unknown type bytes are reported as errors, never panics.
pub fn decode(buf: &[u8]) -> WmxResult<MuxFrame> {
    if buf.len() < MUX_HEADER_LEN {
        return Err(WmxError::Codec(format!(
            "mux frame too short: {} bytes, header is {MUX_HEADER_LEN}",
            buf.len()
        )));
    }
    let kind = MuxFrameKind::try_from(buf[0])?;
    let session_id = wire::read_session_id(&buf[1..MUX_HEADER_LEN]);
    Ok(MuxFrame {
        kind,
        session_id,
        payload: buf[MUX_HEADER_LEN..].to_vec(),
    })
}

/// Split an output payload into dimensions and raw terminal bytes.
pub fn split_output_payload(payload: &[u8]) -> WmxResult<(u16, u16, &[u8])> {
    if payload.len() < 4 {
        return Err(WmxError::Codec(format!(
            "output payload too short: {} bytes",
            payload.len()
        )));
    }
    let cols = u16::from_le_bytes([payload[0], payload[1]]);
    let rows = u16::from_le_bytes([payload[2], payload[3]]);
    Ok((cols, rows, &payload[4..]))
}

/// Parse a resize payload. Short payloads fall back to 80×24.
pub fn parse_resize_payload(payload: &[u8]) -> (u16, u16) {
    if payload.len() < 4 {
        return (80, 24);
    }
    (
        u16::from_le_bytes([payload[0], payload[1]]),
        u16::from_le_bytes([payload[2], payload[3]]),
    )
}
