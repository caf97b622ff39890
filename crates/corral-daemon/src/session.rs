//! Per-connection protocol state machine.
//!
//! A session starts in a frame-reading loop that accumulates client
//! state: `SourceFileName` selects the file that subsequent `Source`
//! frames append to, and every other frame accumulates byte-wise under
//! its command name. Two frames commit the session and end the loop:
//!
//! - `Control` with payload `run` hands the accumulated inbox to the
//!   staging writer and the program runner;
//! - `Version` hands the socket to the version lister.
//!
//! Frames arriving after the commit point are never read. A framing
//! error, an unknown compiler selection, or a staging failure closes
//! the connection.

use std::collections::HashMap;
use std::sync::Arc;

use corral_core::config::BrokerConfig;
use corral_core::protocol::{Frame, FrameCodec};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::sink::FrameSink;
use crate::staging::{self, SourceFile};
use crate::{runner, version};

/// Accumulated client state of one session.
#[derive(Debug, Default)]
pub struct Inbox {
    /// Payload accumulation per command name.
    pub received: HashMap<String, Vec<u8>>,
    /// Source files in first-submission order.
    pub sources: Vec<SourceFile>,
    /// Target of `Source` frames; empty until `SourceFileName` arrives.
    current_filename: String,
}

/// What the session should do after one frame.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Run,
    Version,
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Run,
    Version,
    SourceFileName,
    Source,
    Other,
}

impl Inbox {
    fn accept(&mut self, frame: Frame) -> Step {
        let kind = match frame.command.as_str() {
            "Control" if frame.payload.as_ref() == b"run" => FrameKind::Run,
            "Version" => FrameKind::Version,
            "SourceFileName" => FrameKind::SourceFileName,
            "Source" => FrameKind::Source,
            _ => FrameKind::Other,
        };
        match kind {
            FrameKind::Run => Step::Run,
            FrameKind::Version => Step::Version,
            FrameKind::SourceFileName => {
                self.current_filename = String::from_utf8_lossy(&frame.payload).into_owned();
                Step::Continue
            },
            FrameKind::Source => {
                self.append_source(&frame.payload);
                Step::Continue
            },
            FrameKind::Other => {
                self.received
                    .entry(frame.command)
                    .or_default()
                    .extend_from_slice(&frame.payload);
                Step::Continue
            },
        }
    }

    fn append_source(&mut self, payload: &[u8]) {
        if let Some(existing) = self
            .sources
            .iter_mut()
            .find(|s| s.filename == self.current_filename)
        {
            existing.bytes.extend_from_slice(payload);
        } else {
            self.sources.push(SourceFile {
                filename: self.current_filename.clone(),
                bytes: payload.to_vec(),
            });
        }
    }

    /// The `<name>` from the accumulated `compiler=<name>` selection.
    fn selected_compiler(&self) -> Option<&str> {
        let control = self.received.get("Control")?;
        std::str::from_utf8(control)
            .ok()?
            .strip_prefix("compiler=")
    }
}

/// Drives one client connection to completion.
///
/// The caller holds the admission permit for the duration of this
/// future; every return path releases it.
pub async fn run_session(stream: TcpStream, config: Arc<BrokerConfig>) {
    let (read_half, write_half) = stream.into_split();
    let sink = FrameSink::new(write_half);
    let mut frames = FramedRead::new(read_half, FrameCodec::new());

    let mut inbox = Inbox::default();
    while let Some(next) = frames.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "protocol error, closing session");
                return;
            },
        };
        match inbox.accept(frame) {
            Step::Continue => {},
            Step::Run => {
                // Commit point: the inbox is frozen and the socket now
                // belongs to the runner; later frames go unread.
                drop(frames);
                execute(&config, &sink, &inbox).await;
                return;
            },
            Step::Version => {
                drop(frames);
                version::send_version_list(&config, &sink).await;
                return;
            },
        }
    }
    debug!("session closed by peer");
}

/// Stages the inbox and runs the selected compiler.
async fn execute(config: &BrokerConfig, sink: &FrameSink, inbox: &Inbox) {
    let Some(name) = inbox.selected_compiler() else {
        info!("run requested without a compiler selection, closing session");
        return;
    };
    let Some(compiler) = config.compiler(name) else {
        info!(compiler = %name, "selected compiler is not configured, closing session");
        return;
    };

    let workdir = match staging::create_workdir(&config.system.basedir) {
        Ok(workdir) => workdir,
        Err(error) => {
            warn!(%error, "failed to create workdir, closing session");
            return;
        },
    };
    if let Err(error) = staging::stage_sources(
        &workdir,
        &config.system.storedir,
        &inbox.sources,
        &compiler.output_file,
    )
    .await
    {
        warn!(%error, "staging failed, closing session");
        return;
    }

    runner::run_program(config, sink, &workdir, &inbox.received, compiler).await;
}
