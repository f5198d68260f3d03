//! Length-prefixed message framing over a byte stream.
//!
//! Every message on the wire is a typed, length-prefixed frame:
//!
//! ```text
//! +-------------------+-----------+----------------------+
//! | length (4 bytes)  | type (1)  | payload              |
//! | i32 little-endian |   u8      | (length bytes)       |
//! +-------------------+-----------+----------------------+
//! ```
//!
//! The length counts the payload only, not the prefix or the type byte.
//! With the `network-debug` feature, frames sent by clients carry a
//! length-prefixed diagnostic string between the length and the type byte.
//! Both ends must be built with the same setting.
//!
//! Socket reads can stop anywhere inside a frame. [`FrameDecoder`] keeps the
//! unconsumed tail of every read and glues the next read onto it, so a frame
//! is yielded exactly once, and only after its last byte arrived.

use crate::codec::{self, ByteReader, CodecError, INT_SIZE};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
    /// Frames carry a diagnostic string before the type byte. Default: on
    /// with the `network-debug` feature. Only client frames carry one.
    pub diagnostics: bool,
}

impl FrameConfig {
    /// Config for decoding what the server sends.
    pub fn server_stream() -> Self {
        Self {
            diagnostics: false,
            ..Self::default()
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
            diagnostics: cfg!(feature = "network-debug"),
        }
    }
}

/// Errors that can occur while splitting a stream into frames.
///
/// Every variant means the stream is corrupt; the connection cannot be
/// resynchronised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The length prefix was negative.
    #[error("negative payload length {0}")]
    NegativeLength(i32),

    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The announced payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The diagnostic prefix of a debug frame was malformed.
    #[error("malformed diagnostic prefix: {0}")]
    Diagnostic(#[from] CodecError),
}

/// One complete message: its type byte and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Incremental frame decoder for one connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` already handed out as frames.
    consumed: usize,
    config: FrameConfig,
    last_diagnostic: Option<String>,
}

impl FrameDecoder {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            buffer: Vec::new(),
            consumed: 0,
            config,
            last_diagnostic: None,
        }
    }

    /// Append freshly read bytes after whatever was carried over.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Diagnostic string of the most recent debug frame, if any.
    pub fn last_diagnostic(&self) -> Option<&str> {
        self.last_diagnostic.as_deref()
    }

    /// Decode the next complete frame.
    ///
    /// Returns `Ok(None)` when the remaining bytes are an incomplete frame;
    /// they stay buffered until the next [`feed`](Self::feed).
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let available = &self.buffer[self.consumed..];
        if available.len() < INT_SIZE {
            return Ok(None);
        }

        let mut reader = ByteReader::new(available);
        let length = reader.read_int()?;
        if length < 0 {
            return Err(FrameError::NegativeLength(length));
        }
        let length = length as u32;
        if length > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: length,
                max: self.config.max_payload_size,
            });
        }

        let mut diagnostic = None;
        if self.config.diagnostics {
            if reader.remaining() < INT_SIZE {
                return Ok(None);
            }
            let mut peek = reader.clone();
            let diagnostic_len = peek.read_int()?;
            if diagnostic_len >= 0 && peek.remaining() < diagnostic_len as usize {
                return Ok(None);
            }
            diagnostic = Some(reader.read_string()?);
        }

        if reader.remaining() < 1 + length as usize {
            return Ok(None);
        }
        let kind = reader.read_bytes(1)?[0];
        let payload = reader.read_bytes(length as usize)?.to_vec();
        self.consumed += reader.offset();
        if diagnostic.is_some() {
            self.last_diagnostic = diagnostic;
        }

        Ok(Some(Frame { kind, payload }))
    }

    /// Drain every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            failed: false,
        }
    }
}

/// Iterator returned by [`FrameDecoder::frames`].
///
/// Stops after the first error.
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(frame) => frame.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Frame a message as the server sends it.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(INT_SIZE + 1 + payload.len());
    out.extend_from_slice(&codec::encode_int(payload.len() as i32));
    out.push(kind);
    out.extend_from_slice(payload);
    out
}

/// Frame a message as a client sends it.
///
/// In `network-debug` builds the caller's source location is embedded as the
/// diagnostic string.
#[track_caller]
pub fn encode_client_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    #[cfg(feature = "network-debug")]
    {
        let location = std::panic::Location::caller();
        let diagnostic = format!("{}:{}", location.file(), location.line());
        codec::concat([
            &codec::encode_int(payload.len() as i32)[..],
            &codec::encode_string(&diagnostic)[..],
            &[kind][..],
            payload,
        ])
    }
    #[cfg(not(feature = "network-debug"))]
    {
        encode_frame(kind, payload)
    }
}
