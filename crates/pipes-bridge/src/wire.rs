//! Wire-level value codec shared by both protocol directions.
//!
//! Three field types, one encoding each:
//! - signed 32-bit integer: 4 bytes, big-endian, two's complement
//! - IEEE-754 double: 8 bytes, big-endian
//! - byte string: u32 big-endian length prefix followed by the raw bytes
//!
//! Encoding is stateless and independent of platform byte order. Decoding
//! distinguishes "not enough bytes buffered yet" from a genuinely malformed
//! field so streaming decoders can wait for more input.

use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound on a single length-prefixed byte string (64 MiB).
///
/// A declared length above this is treated as a malformed frame rather than
/// an instruction to buffer indefinitely.
pub const MAX_BYTES_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub enum WireError {
    /// More bytes are needed to finish the current field.
    Incomplete,
    /// The bytes present cannot be a valid field.
    Malformed(String),
}

pub type WireResult<T> = Result<T, WireError>;

pub fn put_int(dst: &mut BytesMut, v: i32) {
    dst.put_i32(v);
}

pub fn put_double(dst: &mut BytesMut, v: f64) {
    dst.put_f64(v);
}

pub fn put_bytes(dst: &mut BytesMut, v: &[u8]) {
    dst.put_u32(v.len() as u32);
    dst.put_slice(v);
}

pub fn put_text(dst: &mut BytesMut, v: &str) {
    put_bytes(dst, v.as_bytes());
}

/// Encodes a bool the way the down protocol expects it: i32 0 or 1.
pub fn put_bool(dst: &mut BytesMut, v: bool) {
    put_int(dst, v as i32);
}

/// Non-consuming reader over a buffered byte stream.
///
/// The caller advances the underlying buffer by [`position`](Self::position)
/// only once a whole message has been decoded, so an `Incomplete` result
/// leaves the buffer untouched.
pub struct WireCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Incomplete);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_int(&mut self) -> WireResult<i32> {
        let raw = self.take(4)?;
        let mut be = [0u8; 4];
        be.copy_from_slice(raw);
        Ok(i32::from_be_bytes(be))
    }

    pub fn get_double(&mut self) -> WireResult<f64> {
        let raw = self.take(8)?;
        let mut be = [0u8; 8];
        be.copy_from_slice(raw);
        Ok(f64::from_be_bytes(be))
    }

    pub fn get_bytes(&mut self) -> WireResult<Bytes> {
        let len = self.get_int()? as u32 as usize;
        if len > MAX_BYTES_LEN {
            return Err(WireError::Malformed(format!(
                "declared string length {len} exceeds {MAX_BYTES_LEN}"
            )));
        }
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn get_text(&mut self) -> WireResult<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| WireError::Malformed("invalid UTF-8 in string field".to_string()))
    }

    pub fn get_bool(&mut self) -> WireResult<bool> {
        match self.get_int()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::Malformed(format!(
                "invalid boolean field value {other}"
            ))),
        }
    }
}
