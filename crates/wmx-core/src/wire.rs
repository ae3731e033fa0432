//! Low-level field encoding shared by both codecs.
//!
//! Session id fields are 8 ASCII bytes, NUL-padded (and truncated on
//! encode). Structured sidecar payloads are flat, order-dependent fields:
//! strings are a u16 little-endian byte length followed by UTF-8 bytes,
//! integers are fixed-width little-endian, booleans are one byte.

use crate::error::{WmxError, WmxResult};

/// Width of the session id field in both wire formats.
pub const SESSION_ID_LEN: usize = 8;

/// Write a session id into an 8-byte field, NUL-padding or truncating.
pub fn write_session_id(dest: &mut [u8], session_id: &str) {
    debug_assert!(dest.len() >= SESSION_ID_LEN);
    dest[..SESSION_ID_LEN].fill(0);
    let bytes = session_id.as_bytes();
    let len = bytes.len().min(SESSION_ID_LEN);
    dest[..len].copy_from_slice(&bytes[..len]);
}

/// Read an 8-byte session id field, trimming trailing NULs.
pub fn read_session_id(src: &[u8]) -> String {
    let field = &src[..SESSION_ID_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(SESSION_ID_LEN);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Sequential writer for structured payloads.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed UTF-8 string. Strings longer than a u16 length field
    /// can carry are truncated at a char boundary.
    pub fn put_str(&mut self, s: &str) {
        let mut bytes = s.as_bytes();
        if bytes.len() > u16::MAX as usize {
            let mut cut = u16::MAX as usize;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            bytes = &bytes[..cut];
        }
        self.put_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential reader for structured payloads.
///
/// Every accessor returns `Err` on short input: decoding is handed exactly
/// the payload slice and must never panic.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> WmxResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WmxError::Codec(format!(
                "payload truncated: need {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> WmxResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> WmxResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> WmxResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> WmxResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> WmxResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i64(&mut self) -> WmxResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_str(&mut self) -> WmxResult<String> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WmxError::Codec(format!("invalid UTF-8 in string field: {e}")))
    }

    /// All bytes left in the payload.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}
