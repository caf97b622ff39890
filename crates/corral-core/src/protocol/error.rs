//! Protocol error types.

/// Maximum size of a single frame payload on the wire (16 MiB).
///
/// The cap bounds the receive buffer: a peer cannot make the daemon
/// allocate more than one frame's worth of memory per connection.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors surfaced by the frame codec.
///
/// Note that an incomplete or locally-malformed frame is *not* an error:
/// the decoder reports "no frame yet" and leaves the buffer untouched so
/// a later read can complete it. Only conditions that can never resolve
/// (an over-cap length, a buffer growing without bound) are errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The declared payload length exceeds the frame cap.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared payload size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// The receive buffer grew past the frame cap without a parseable
    /// frame prefix.
    #[error("unparseable input: {buffered} bytes buffered without a complete frame")]
    Unparseable {
        /// Bytes accumulated when the connection was given up on.
        buffered: usize,
    },

    /// An I/O error from the underlying transport.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
