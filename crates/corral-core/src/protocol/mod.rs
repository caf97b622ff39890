//! Wire protocol for the broker's client connections.
//!
//! Every protocol unit ("frame") travels as one text-framed record:
//!
//! ```text
//! +---------+----+-----------------+-----+------------------+----+
//! | command | SP | decimal length  | ":" | QP payload bytes | LF |
//! +---------+----+-----------------+-----+------------------+----+
//! ```
//!
//! The length counts the *encoded* payload bytes; payloads are binary and
//! carried quoted-printable on the wire. Frames flow in both directions:
//! clients send `SourceFileName`/`Source`/`Control`/... records, the
//! daemon answers with `Control`/`CompilerMessageS`/`StdOut`/`ExitCode`/
//! ... records.
//!
//! # Module Overview
//!
//! - [`error`]: protocol error types ([`ProtocolError`])
//! - [`framing`]: the frame codec ([`FrameCodec`], [`Frame`])
//! - [`qp`]: the quoted-printable payload transform
//!
//! # Security Considerations
//!
//! - The declared payload length is validated against [`MAX_FRAME_SIZE`]
//!   before any allocation.
//! - A receive buffer that grows past the frame cap without yielding a
//!   frame is rejected rather than retained.

pub mod error;
pub mod framing;
pub mod qp;

pub use error::{MAX_FRAME_SIZE, ProtocolError};
pub use framing::{Frame, FrameCodec, encode_frame_into};
