//! Framing: newline-delimited UTF-8 JSON, one envelope per line.

use crate::envelope::{Envelope, EnvelopeError};

const DELIMITER: u8 = b'\n';

/// Default cap on a single line (and on undelimited buffered input).
pub const MAX_FRAME_LEN: usize = 1024 * 1024; // 1 MiB

/// Encode an envelope into a single frame: compact JSON followed by `\n`.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame_with_limit(envelope, MAX_FRAME_LEN)
}

/// Like [`encode_frame`], refusing lines longer than `max` bytes (delimiter excluded).
pub fn encode_frame_with_limit(
    envelope: &Envelope,
    max: usize,
) -> Result<Vec<u8>, FrameEncodeError> {
    // serde_json escapes control characters, so the line never contains a raw newline.
    let mut out = serde_json::to_vec(envelope)?;
    if out.len() > max {
        return Err(FrameEncodeError::TooLarge { len: out.len(), max });
    }
    out.push(DELIMITER);
    Ok(out)
}

/// Error encoding an envelope into a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large ({len} bytes, limit {max})")]
    TooLarge { len: usize, max: usize },
}

/// Decode the first frame at the front of `bytes`. Returns the envelope and the number of bytes consumed, delimiter included.
/// Call with a partial buffer; returns `NeedMore` if no delimiter is present yet.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    let end = bytes
        .iter()
        .position(|&b| b == DELIMITER)
        .ok_or(FrameDecodeError::NeedMore)?;
    if end > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge {
            len: end,
            max: MAX_FRAME_LEN,
        });
    }
    let envelope = decode_line(&bytes[..end])?;
    Ok((envelope, end + 1))
}

fn decode_line(line: &[u8]) -> Result<Envelope, FrameDecodeError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return Err(FrameDecodeError::EmptyLine);
    }
    let text = std::str::from_utf8(line).map_err(FrameDecodeError::Utf8)?;
    let value: serde_json::Value = serde_json::from_str(text).map_err(FrameDecodeError::Json)?;
    Ok(Envelope::decode(&value)?)
}

/// Error decoding a frame. Everything except `TooLarge` affects one line only.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large ({len} bytes, limit {max})")]
    TooLarge { len: usize, max: usize },
    #[error("empty line")]
    EmptyLine,
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(std::str::Utf8Error),
    #[error("frame is not valid JSON: {0}")]
    Json(serde_json::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl FrameDecodeError {
    /// True when the stream can continue past this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameDecodeError::TooLarge { .. })
    }
}

/// Incremental decoder: accumulates bytes from partial reads and yields complete envelopes.
///
/// Iterating stops at the first `NeedMore`; feed more bytes and iterate again to resume.
#[derive(Debug)]
pub struct FrameCodec {
    buf: Vec<u8>,
    /// Bytes at the front of `buf` already known to contain no delimiter.
    scanned: usize,
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that rejects any line, complete or pending, longer than `max_frame_len` bytes.
    pub fn with_limit(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame_len,
        }
    }

    /// Append received bytes to the buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete line. A line that fails to decode is discarded so the following frames remain reachable.
    pub fn decode_next(&mut self) -> Result<Envelope, FrameDecodeError> {
        let Some(rel) = self.buf[self.scanned..].iter().position(|&b| b == DELIMITER) else {
            self.scanned = self.buf.len();
            return Err(FrameDecodeError::NeedMore);
        };
        let end = self.scanned + rel;
        let result = if end > self.max_frame_len {
            Err(FrameDecodeError::TooLarge {
                len: end,
                max: self.max_frame_len,
            })
        } else {
            decode_line(&self.buf[..end])
        };
        self.buf.drain(..=end);
        self.scanned = 0;
        result
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Fails with `TooLarge` when more bytes than the limit are buffered after the last delimiter.
    pub fn check_limit(&self) -> Result<(), FrameDecodeError> {
        let pending = match self.buf.iter().rposition(|&b| b == DELIMITER) {
            Some(last) => self.buf.len() - last - 1,
            None => self.buf.len(),
        };
        if pending > self.max_frame_len {
            return Err(FrameDecodeError::TooLarge {
                len: pending,
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

impl Iterator for FrameCodec {
    type Item = Result<Envelope, FrameDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.decode_next() {
            Err(FrameDecodeError::NeedMore) => None,
            other => Some(other),
        }
    }
}
