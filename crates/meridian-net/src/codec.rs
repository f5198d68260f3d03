//! Primitive wire encoding.
//!
//! All values are written little-endian with fixed widths:
//!
//! ```text
//! int     4 bytes, i32 little-endian
//! float   4 bytes, IEEE-754 f32 little-endian
//! bool    1 byte, 0 = false, anything else = true
//! string  int byte length, then UTF-8 bytes
//! vec3    three floats x, y, z
//! ```
//!
//! Encoding is infallible. Decoding goes through [`ByteReader`], which only
//! fails when a payload is shorter than its contents claim.

use glam::Vec3;

/// Byte width of an encoded `int`.
pub const INT_SIZE: usize = 4;
/// Byte width of an encoded `float`.
pub const FLOAT_SIZE: usize = 4;
/// Byte width of an encoded `vec3`.
pub const VEC3_SIZE: usize = 3 * FLOAT_SIZE;

/// Errors raised while reading primitives out of a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The payload ended before the value was complete.
    #[error("payload truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A length prefix was negative.
    #[error("negative length prefix {0}")]
    NegativeLength(i32),

    /// A string field did not contain valid UTF-8.
    #[error("string at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),
}

pub fn encode_int(value: i32) -> [u8; INT_SIZE] {
    value.to_le_bytes()
}

pub fn encode_float(value: f32) -> [u8; FLOAT_SIZE] {
    value.to_le_bytes()
}

pub fn encode_bool(value: bool) -> [u8; 1] {
    [u8::from(value)]
}

/// Length-prefixed UTF-8.
pub fn encode_string(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(INT_SIZE + value.len());
    out.extend_from_slice(&encode_int(value.len() as i32));
    out.extend_from_slice(value.as_bytes());
    out
}

pub fn encode_vec3(value: Vec3) -> [u8; VEC3_SIZE] {
    let mut out = [0u8; VEC3_SIZE];
    out[0..4].copy_from_slice(&encode_float(value.x));
    out[4..8].copy_from_slice(&encode_float(value.y));
    out[8..12].copy_from_slice(&encode_float(value.z));
    out
}

/// Join byte sequences in order.
pub fn concat<I, B>(parts: I) -> Vec<u8>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(part.as_ref());
    }
    out
}

/// Decode a float from exactly [`FLOAT_SIZE`] bytes.
///
/// Returns `None` when the slice has the wrong width, which callers treat as
/// "not a position value".
pub fn decode_float(bytes: &[u8]) -> Option<f32> {
    let raw: [u8; FLOAT_SIZE] = bytes.try_into().ok()?;
    Some(f32::from_le_bytes(raw))
}

/// Sequential reader over a complete payload.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Current read position from the start of the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take exactly `count` bytes.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < count {
            return Err(CodecError::Truncated {
                offset: self.offset,
                needed: count,
                available: self.remaining(),
            });
        }
        let start = self.offset;
        self.offset += count;
        Ok(&self.buf[start..self.offset])
    }

    /// Take everything left in the buffer.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let start = self.offset;
        self.offset = self.buf.len();
        &self.buf[start..]
    }

    pub fn read_int(&mut self) -> Result<i32, CodecError> {
        let bytes = self.read_bytes(INT_SIZE)?;
        let mut raw = [0u8; INT_SIZE];
        raw.copy_from_slice(bytes);
        Ok(i32::from_le_bytes(raw))
    }

    pub fn read_float(&mut self) -> Result<f32, CodecError> {
        let bytes = self.read_bytes(FLOAT_SIZE)?;
        let mut raw = [0u8; FLOAT_SIZE];
        raw.copy_from_slice(bytes);
        Ok(f32::from_le_bytes(raw))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_bytes(1)?[0] != 0)
    }

    /// Read an int length prefix followed by that many bytes.
    pub fn read_sized(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_int()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        self.read_bytes(len as usize)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let start = self.offset;
        let bytes = self.read_sized()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8(start))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, CodecError> {
        let x = self.read_float()?;
        let y = self.read_float()?;
        let z = self.read_float()?;
        Ok(Vec3::new(x, y, z))
    }
}
