//! Compiler version listing.
//!
//! On a `Version` request the daemon probes every displayable compiler
//! whose profile carries a version command: the command runs under `/`
//! without any jail prefix, a non-zero exit drops the entry, and the
//! first stdout line becomes the reported version. The aggregate goes
//! back to the client as one `VersionResult` frame holding a JSON
//! array.

use std::process::Stdio;

use corral_core::config::BrokerConfig;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::sink::FrameSink;

/// One entry of the `VersionResult` payload.
#[derive(Debug, Serialize)]
struct VersionEntry<'a> {
    name: &'a str,
    version: String,
    switches: &'a [String],
}

/// Probes the catalogue and sends the `VersionResult` frame.
pub async fn send_version_list(config: &BrokerConfig, sink: &FrameSink) {
    info!("building compiler list");

    let mut entries = Vec::new();
    for compiler in &config.compilers {
        if !compiler.displayable || compiler.version_command.is_empty() {
            continue;
        }
        match probe_version(&compiler.version_command).await {
            Ok(Some(version)) => entries.push(VersionEntry {
                name: &compiler.name,
                version,
                switches: &compiler.switches,
            }),
            Ok(None) => {
                debug!(compiler = %compiler.name, "version probe reported nothing, skipping");
            },
            Err(error) => {
                debug!(compiler = %compiler.name, %error, "version probe failed, skipping");
            },
        }
    }

    match serde_json::to_vec(&entries) {
        Ok(payload) => sink.send("VersionResult", &payload).await,
        Err(error) => warn!(%error, "failed to serialize the version list"),
    }
}

/// Runs one version command and returns its first stdout line, or
/// `None` when the probe exits non-zero or prints nothing.
async fn probe_version(argv: &[String]) -> std::io::Result<Option<String>> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(None);
    };

    let mut child = Command::new(program)
        .args(args)
        .current_dir("/")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let stdout = child.stdout.take();

    // The probe's output is one short line, well inside the pipe
    // buffer, so waiting before reading cannot deadlock.
    let status = child.wait().await?;
    if !status.success() {
        return Ok(None);
    }
    let Some(stdout) = stdout else {
        return Ok(None);
    };

    let mut line = String::new();
    if BufReader::new(stdout).read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
