//! # corral-core
//!
//! Core library for corral - a compile/execute broker for untrusted code.
//!
//! This crate provides the building blocks shared by the daemon and by
//! protocol clients: the framed wire protocol with its quoted-printable
//! payload transform, and the broker configuration model (compiler,
//! switch, and jail catalogues).
//!
//! ## Example
//!
//! ```rust
//! use corral_core::protocol::{Frame, FrameCodec};
//! use bytes::BytesMut;
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut codec = FrameCodec::new();
//! let mut buf = BytesMut::new();
//! codec
//!     .encode(Frame::new("Control", &b"Start"[..]), &mut buf)
//!     .unwrap();
//! let frame = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(frame.command, "Control");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod protocol;

pub use config::{BrokerConfig, CompilerProfile, ConfigError, JailProfile, SwitchProfile};
pub use protocol::{Frame, FrameCodec, ProtocolError};
