//! Text frame codec for the broker protocol.
//!
//! This module implements a [`tokio_util::codec`] compatible codec for
//! the broker's framing. Each frame consists of:
//!
//! ```text
//! +---------+----+----------------+-----+------------------+----+
//! | command | SP | decimal length | ":" | payload (QP)     | LF |
//! +---------+----+----------------+-----+------------------+----+
//! ```
//!
//! The command is one or more non-whitespace bytes, the length is the
//! size of the *encoded* payload, and the payload is quoted-printable
//! (see [`super::qp`]). Decoded frames carry the raw payload bytes.
//!
//! # Invariants
//!
//! - The decoder is prefix-safe: partial input yields `Ok(None)` and
//!   consumes nothing, so a frame split across reads decodes once
//!   complete. The concatenation of valid frames decodes to the same
//!   frame sequence regardless of read boundaries.
//! - A locally-malformed prefix also yields `Ok(None)`: framing
//!   mismatch manifests as "no progress", and the connection winds down
//!   at EOF instead of mid-stream.
//! - The declared length is validated against the frame cap BEFORE any
//!   allocation, and a buffer growing past the cap without a complete
//!   frame is rejected.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{MAX_FRAME_SIZE, ProtocolError};
use super::qp;

/// Slack on top of [`MAX_FRAME_SIZE`] for the command, length, and
/// separator bytes when judging whether a buffer can still contain a
/// valid frame prefix.
const HEADER_SLACK: usize = 256;

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command, e.g. `Source` or `Control`.
    pub command: String,
    /// Raw payload bytes (already quoted-printable decoded).
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame from a command and raw payload bytes.
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }
}

/// Frame codec implementing the text framing above.
///
/// Used with [`tokio_util::codec::FramedRead`] on the inbound half of a
/// client connection; the daemon's outbound path encodes through
/// [`encode_frame_into`] so that many producers can share one socket.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Maximum allowed decoded-side payload size.
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Creates a frame codec with the default frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates a frame codec with a custom frame cap.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        assert!(
            max_size <= MAX_FRAME_SIZE,
            "max_size {max_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            max_frame_size: max_size,
        }
    }

    /// Returns the frame cap for this codec.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/// Outcome of attempting to parse one frame from the front of a buffer.
enum Parsed {
    /// A complete frame and the number of bytes it occupied.
    Frame(Frame, usize),
    /// The buffer does not (yet) start with a complete frame.
    Incomplete,
}

/// Attempts to parse one frame from the front of `buf`.
///
/// Returns [`Parsed::Incomplete`] for both truncated and malformed
/// prefixes - neither consumes bytes, and a malformed prefix simply
/// never completes. Only an over-cap declared length is a hard error.
fn parse_frame(buf: &[u8], max: usize) -> Result<Parsed, ProtocolError> {
    // Command: one or more non-whitespace bytes.
    let mut i = 0;
    while i < buf.len() && !buf[i].is_ascii_whitespace() {
        i += 1;
    }
    if i == 0 || i == buf.len() {
        return Ok(Parsed::Incomplete);
    }
    let command = &buf[..i];

    // Separator: one or more whitespace bytes.
    let mut j = i;
    while j < buf.len() && buf[j].is_ascii_whitespace() {
        j += 1;
    }
    if j == buf.len() {
        return Ok(Parsed::Incomplete);
    }

    // Encoded payload length; saturating so absurd digit runs cannot
    // overflow, validated against the cap before any allocation.
    let mut k = j;
    let mut length: usize = 0;
    while k < buf.len() && buf[k].is_ascii_digit() {
        length = length
            .saturating_mul(10)
            .saturating_add(usize::from(buf[k] - b'0'));
        k += 1;
    }
    if k == j || k == buf.len() {
        return Ok(Parsed::Incomplete);
    }
    if length > max {
        return Err(ProtocolError::FrameTooLarge { size: length, max });
    }
    if buf[k] != b':' {
        return Ok(Parsed::Incomplete);
    }

    // Payload plus the trailing LF.
    let start = k + 1;
    let end = start + length;
    if buf.len() <= end {
        return Ok(Parsed::Incomplete);
    }
    if buf[end] != b'\n' {
        return Ok(Parsed::Incomplete);
    }

    let frame = Frame {
        command: String::from_utf8_lossy(command).into_owned(),
        payload: Bytes::from(qp::decode(&buf[start..end])),
    };
    Ok(Parsed::Frame(frame, end + 1))
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match parse_frame(src, self.max_frame_size)? {
            Parsed::Frame(frame, consumed) => {
                src.advance(consumed);
                Ok(Some(frame))
            },
            Parsed::Incomplete => {
                // A valid frame prefix fits in cap + slack; anything
                // larger can never complete and would otherwise pin an
                // unbounded buffer.
                if src.len() > self.max_frame_size + HEADER_SLACK {
                    return Err(ProtocolError::Unparseable {
                        buffered: src.len(),
                    });
                }
                Ok(None)
            },
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let encoded = qp::encode(&item.payload);
        if encoded.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: encoded.len(),
                max: self.max_frame_size,
            });
        }
        dst.extend_from_slice(item.command.as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(encoded.len().to_string().as_bytes());
        dst.extend_from_slice(b":");
        dst.extend_from_slice(&encoded);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

/// Appends one wire-encoded frame to `dst`.
///
/// This is the outbound fast path used by the daemon's write
/// multiplexer; encoding never fails.
pub fn encode_frame_into(dst: &mut Vec<u8>, command: &str, payload: &[u8]) {
    let encoded = qp::encode(payload);
    dst.extend_from_slice(command.as_bytes());
    dst.push(b' ');
    dst.extend_from_slice(encoded.len().to_string().as_bytes());
    dst.push(b':');
    dst.extend_from_slice(&encoded);
    dst.push(b'\n');
}
