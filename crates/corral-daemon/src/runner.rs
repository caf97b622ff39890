//! Two-phase compile/run orchestrator.
//!
//! A committed session runs at most two children in sequence: the
//! compile command, then - only on a clean exit - the run command.
//! Each phase streams its stdout and stderr back to the client as
//! frames while a shared output budget and a two-stage kill timer
//! (SIGXCPU after the phase's soft limit, SIGKILL after the jail's
//! grace period) bound the child.
//!
//! # Ordering
//!
//! The emitted frame sequence is always `Control: Start`, then output
//! frames of the executed phases, then exactly one of `ExitCode` or
//! `Signal`, then `Control: Finish`. Output forwarders are joined
//! before the terminal frames are enqueued, and the frame sink
//! preserves enqueue order on the wire.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use corral_core::config::{BrokerConfig, CompilerProfile, JailProfile, SwitchProfile};
use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::child::{ChildProcess, OutputBudget, RunError, signal_name};
use crate::sink::FrameSink;
use crate::staging::Workdir;

/// Read size for the stdout/stderr forwarders; one chunk is also the
/// granularity at which output limits are enforced.
const FORWARD_CHUNK: usize = 8192;

/// One child execution within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    /// Fully-assembled argv, jail prefix included.
    pub argv: Vec<String>,
    /// Inbox key whose payload feeds the child's stdin; empty for none.
    pub stdin_key: &'static str,
    /// Frame command for stdout chunks.
    pub stdout_frame: &'static str,
    /// Frame command for stderr chunks.
    pub stderr_frame: &'static str,
    /// Soft wall-clock limit before SIGXCPU.
    pub soft_time_limit: Duration,
}

/// Builds the compile and run phases for a committed session.
///
/// Selected switch ids (comma-separated in the `CompilerOption`
/// payload) splice their flags into the compile or run argv in the
/// compiler profile's declared order, at the switch's insert position
/// (0 appends). `CompilerOptionRaw`/`RuntimeOptionRaw` payloads append
/// one argv element per line, CRLF tolerated, trailing empty line
/// dropped. Both argvs get the jail command prefix last.
#[must_use]
pub fn build_phases(
    compiler: &CompilerProfile,
    switches: &HashMap<String, SwitchProfile>,
    jail: &JailProfile,
    received: &HashMap<String, Vec<u8>>,
) -> [PhaseSpec; 2] {
    let mut compile_argv = compiler.compile_command.clone();
    let mut run_argv = compiler.run_command.clone();

    let selected: std::collections::HashSet<String> = received
        .get("CompilerOption")
        .map(|raw| {
            String::from_utf8_lossy(raw)
                .split([',', '\n'])
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    for id in &compiler.switches {
        if !selected.contains(id) {
            continue;
        }
        let Some(switch) = switches.get(id) else {
            continue;
        };
        let argv = if switch.runtime {
            &mut run_argv
        } else {
            &mut compile_argv
        };
        if switch.insert_position == 0 {
            argv.extend(switch.flags.iter().cloned());
        } else {
            let at = switch.insert_position.min(argv.len());
            argv.splice(at..at, switch.flags.iter().cloned());
        }
    }

    for (key, argv) in [
        ("CompilerOptionRaw", &mut compile_argv),
        ("RuntimeOptionRaw", &mut run_argv),
    ] {
        let Some(raw) = received.get(key) else {
            continue;
        };
        let text = String::from_utf8_lossy(raw).replace("\r\n", "\n");
        let mut parts: Vec<String> = text.split(['\n', '\r']).map(ToString::to_string).collect();
        if parts.last().is_some_and(String::is_empty) {
            parts.pop();
        }
        argv.extend(parts);
    }

    let jailed = |argv: Vec<String>| {
        let mut full = jail.jail_command.clone();
        full.extend(argv);
        full
    };

    [
        PhaseSpec {
            argv: jailed(compile_argv),
            stdin_key: "",
            stdout_frame: "CompilerMessageS",
            stderr_frame: "CompilerMessageE",
            soft_time_limit: jail.compile_time_limit,
        },
        PhaseSpec {
            argv: jailed(run_argv),
            stdin_key: "StdIn",
            stdout_frame: "StdOut",
            stderr_frame: "StdErr",
            soft_time_limit: jail.program_duration,
        },
    ]
}

/// Runs the phases of a committed session and emits the terminal
/// frames.
///
/// Always emits `Control: Start` first and `Control: Finish` last; in
/// between, phase output and then `ExitCode`/`Signal` for the last
/// executed phase (or `Signal: spawn-failed` if a child could not be
/// started). The client socket may die midway; the sink then discards
/// frames while the child is still drained to completion.
pub async fn run_program(
    config: &BrokerConfig,
    sink: &FrameSink,
    workdir: &Workdir,
    received: &HashMap<String, Vec<u8>>,
    compiler: &CompilerProfile,
) {
    let Some(jail) = config.jail_for(compiler) else {
        warn!(compiler = %compiler.name, "compiler references an unknown jail");
        return;
    };
    let phases = build_phases(compiler, &config.switches, jail, received);

    info!(
        compiler = %compiler.name,
        workdir = %workdir.unique_name,
        "running program"
    );
    sink.send("Control", b"Start").await;

    let mut last_status: Option<ExitStatus> = None;
    for phase in phases {
        match run_phase(sink, workdir, received, jail, &phase).await {
            Ok(status) => {
                last_status = Some(status);
                if !status.success() {
                    break;
                }
            },
            Err(error) => {
                warn!(%error, argv = ?phase.argv, "phase could not be executed");
                sink.send("Signal", b"spawn-failed").await;
                sink.send("Control", b"Finish").await;
                return;
            },
        }
    }

    if let Some(status) = last_status {
        if let Some(code) = status.code() {
            sink.send("ExitCode", code.to_string().as_bytes()).await;
        } else if let Some(signo) = status.signal() {
            sink.send("Signal", signal_name(signo).as_bytes()).await;
        }
    }
    info!(compiler = %compiler.name, workdir = %workdir.unique_name, "finished");
    sink.send("Control", b"Finish").await;
}

/// Spawns one phase child, forwards its stdio, and enforces its
/// limits. Returns once the child has exited and both output
/// forwarders have drained.
async fn run_phase(
    sink: &FrameSink,
    workdir: &Workdir,
    received: &HashMap<String, Vec<u8>>,
    jail: &JailProfile,
    phase: &PhaseSpec,
) -> Result<ExitStatus, RunError> {
    let mut child = ChildProcess::spawn(&workdir.path, &phase.argv)?;
    let budget = OutputBudget::new(
        jail.output_limit_warn,
        jail.output_limit_kill,
        child.state(),
    );

    let stdin_bytes = received.get(phase.stdin_key).cloned().unwrap_or_default();
    let stdin_pipe = child.stdin.take();
    let stdin_task = tokio::spawn(async move {
        if let Some(mut pipe) = stdin_pipe {
            if !stdin_bytes.is_empty() {
                // The child may exit without reading; a broken pipe
                // here is not this session's problem.
                let _ = pipe.write_all(&stdin_bytes).await;
            }
            drop(pipe);
        }
    });
    let stdout_task = tokio::spawn(forward_output(
        child.stdout.take(),
        sink.clone(),
        phase.stdout_frame,
        Arc::clone(&budget),
    ));
    let stderr_task = tokio::spawn(forward_output(
        child.stderr.take(),
        sink.clone(),
        phase.stderr_frame,
        Arc::clone(&budget),
    ));

    let status = wait_with_limits(&mut child, phase.soft_time_limit, jail.kill_wait).await?;

    // Drain whatever the child left in its pipes before any terminal
    // frame can be enqueued.
    let _ = stdin_task.await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    debug!(status = ?status, forwarded = budget.written(), "phase complete");
    Ok(status)
}

/// Waits for the child with the soft/hard kill ladder: SIGXCPU once
/// the soft limit expires, SIGKILL once the grace period after it
/// expires too.
async fn wait_with_limits(
    child: &mut ChildProcess,
    soft_time_limit: Duration,
    kill_wait: Duration,
) -> Result<ExitStatus, RunError> {
    let state = Arc::clone(child.state());
    tokio::select! {
        status = child.wait() => status,
        () = sleep(soft_time_limit) => {
            debug!(pid = state.pid(), "soft time limit expired, sending SIGXCPU");
            state.kill(Signal::SIGXCPU);
            tokio::select! {
                status = child.wait() => status,
                () = sleep(kill_wait) => {
                    debug!(pid = state.pid(), "kill wait expired, sending SIGKILL");
                    state.kill(Signal::SIGKILL);
                    child.wait().await
                }
            }
        }
    }
}

/// Shuttles one child output pipe to the client in [`FORWARD_CHUNK`]
/// reads, feeding the output budget after each chunk. The await on
/// [`FrameSink::send`] is what slows a fast child down to the
/// client's pace.
async fn forward_output<R>(
    pipe: Option<R>,
    sink: FrameSink,
    frame: &'static str,
    budget: Arc<OutputBudget>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; FORWARD_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                sink.send(frame, &chunk[..n]).await;
                budget.add(n);
            },
        }
    }
}
