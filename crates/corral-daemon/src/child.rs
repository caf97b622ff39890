//! Child process plumbing: spawn, wait, signal, and output budgeting.
//!
//! Every phase of a session runs one child with all three stdio streams
//! piped. The tokio [`Child`] is mutably borrowed by the status waiter,
//! so signal delivery goes through a shared [`ChildState`] instead: the
//! kill timers and the output budget hold it (the budget weakly) and
//! signal the raw pid for as long as the child has not been reaped.

use std::path::Path;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::process::Stdio;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// Errors from spawning or waiting on a phase child.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The configured argv was empty.
    #[error("cannot spawn an empty command")]
    EmptyCommand,

    /// The child could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child failed.
    #[error("failed to wait on child: {0}")]
    Wait(#[source] std::io::Error),
}

/// Signalling handle shared with kill timers and the output budget.
///
/// `finished` turns true once the child has been reaped; signals are
/// suppressed from then on so a recycled pid is never targeted.
#[derive(Debug)]
pub struct ChildState {
    pid: Pid,
    finished: AtomicBool,
}

impl ChildState {
    /// Sends `signal` to the child unless it has already been reaped.
    ///
    /// Best-effort: delivery errors (e.g. the child died between the
    /// check and the call) are logged and swallowed.
    pub fn kill(&self, signal: Signal) {
        // pid 0 would target the daemon's own process group.
        if self.pid.as_raw() <= 0 || self.finished.load(Ordering::Acquire) {
            return;
        }
        if let Err(errno) = kill(self.pid, signal) {
            debug!(pid = self.pid.as_raw(), %signal, %errno, "signal not delivered");
        }
    }

    /// Raw pid, for logging.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }
}

/// A spawned phase child with its pipes and signalling handle.
pub struct ChildProcess {
    child: Child,
    state: Arc<ChildState>,
    /// Write end of the child's stdin; taken by the stdin forwarder.
    pub stdin: Option<ChildStdin>,
    /// Read end of the child's stdout; taken by a forwarder.
    pub stdout: Option<ChildStdout>,
    /// Read end of the child's stderr; taken by a forwarder.
    pub stderr: Option<ChildStderr>,
}

impl ChildProcess {
    /// Spawns `argv` with `workdir` as its working directory and all
    /// three stdio streams piped.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::EmptyCommand`] for an empty argv and
    /// [`RunError::Spawn`] if the exec fails; a failed spawn leaves no
    /// child behind.
    pub fn spawn(workdir: &Path, argv: &[String]) -> Result<Self, RunError> {
        let (program, args) = argv.split_first().ok_or(RunError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

        let pid = child.id().map_or(0, |id| {
            i32::try_from(id).unwrap_or_default()
        });
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(Self {
            child,
            state: Arc::new(ChildState {
                pid: Pid::from_raw(pid),
                finished: AtomicBool::new(false),
            }),
            stdin,
            stdout,
            stderr,
        })
    }

    /// Shared signalling handle for timers and the output budget.
    #[must_use]
    pub fn state(&self) -> &Arc<ChildState> {
        &self.state
    }

    /// Waits for the child to exit and marks it reaped.
    ///
    /// Cancel-safe, like the underlying [`Child::wait`]; `finished` is
    /// only set once a wait actually completes.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Wait`] if the underlying wait fails.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, RunError> {
        let status = self.child.wait().await.map_err(RunError::Wait)?;
        self.state.finished.store(true, Ordering::Release);
        Ok(status)
    }
}

/// Aggregate stdout+stderr byte budget for one child.
///
/// Both output forwarders of a phase feed the same budget. Crossing the
/// warn threshold sends SIGXFSZ so the program can notice; crossing the
/// kill threshold sends SIGKILL. Resending on later chunks is harmless:
/// the child is either already dying or chose to ignore SIGXFSZ.
#[derive(Debug)]
pub struct OutputBudget {
    warn: u64,
    kill: u64,
    written: AtomicU64,
    child: Weak<ChildState>,
}

impl OutputBudget {
    /// Creates a budget bound to a child.
    #[must_use]
    pub fn new(warn: u64, kill: u64, child: &Arc<ChildState>) -> Arc<Self> {
        Arc::new(Self {
            warn,
            kill,
            written: AtomicU64::new(0),
            child: Arc::downgrade(child),
        })
    }

    /// Records `len` forwarded bytes and escalates on threshold
    /// crossings. The counter saturates instead of wrapping.
    pub fn add(&self, len: usize) {
        let _ = self
            .written
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(len as u64))
            });
        let total = self.written.load(Ordering::Acquire);

        let Some(child) = self.child.upgrade() else {
            return;
        };
        if total > self.kill {
            child.kill(Signal::SIGKILL);
        } else if total > self.warn {
            child.kill(Signal::SIGXFSZ);
        }
    }

    /// Total bytes recorded so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }
}

/// Formats an exit signal number the way clients expect: the signal
/// name without its `SIG` prefix (`KILL`, `XCPU`, `SEGV`, ...).
#[must_use]
pub fn signal_name(signo: i32) -> String {
    Signal::try_from(signo).map_or_else(
        |_| format!("signal {signo}"),
        |signal| {
            signal
                .as_str()
                .strip_prefix("SIG")
                .unwrap_or(signal.as_str())
                .to_string()
        },
    )
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn spawn_and_wait_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut child =
            ChildProcess::spawn(dir.path(), &argv(&["sh", "-c", "exit 7"])).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test]
    async fn spawn_uses_the_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), b"x").unwrap();
        let mut child =
            ChildProcess::spawn(dir.path(), &argv(&["sh", "-c", "test -f marker"])).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(0));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_a_zombie() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChildProcess::spawn(dir.path(), &argv(&["corral-no-such-binary"]));
        assert!(matches!(result, Err(RunError::Spawn { .. })));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ChildProcess::spawn(dir.path(), &[]),
            Err(RunError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn kill_terminates_a_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = ChildProcess::spawn(dir.path(), &argv(&["sleep", "30"])).unwrap();
        child.state().kill(Signal::SIGKILL);
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn kill_after_reap_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = ChildProcess::spawn(dir.path(), &argv(&["true"])).unwrap();
        let state = Arc::clone(child.state());
        child.wait().await.unwrap();
        // Must not signal a recycled pid; this is a no-op.
        state.kill(Signal::SIGKILL);
    }

    #[tokio::test]
    async fn budget_kills_over_the_hard_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = ChildProcess::spawn(dir.path(), &argv(&["sleep", "30"])).unwrap();
        let budget = OutputBudget::new(16, 64, child.state());

        budget.add(10);
        assert_eq!(budget.written(), 10);
        budget.add(100);

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn budget_counter_saturates() {
        let state = Arc::new(ChildState {
            pid: Pid::from_raw(0),
            finished: AtomicBool::new(true),
        });
        let budget = OutputBudget::new(u64::MAX, u64::MAX, &state);
        budget.add(usize::MAX);
        budget.add(usize::MAX);
        assert_eq!(budget.written(), u64::MAX);
    }

    #[test]
    fn signal_names_drop_the_sig_prefix() {
        assert_eq!(signal_name(libc::SIGKILL), "KILL");
        assert_eq!(signal_name(libc::SIGXCPU), "XCPU");
        assert_eq!(signal_name(libc::SIGXFSZ), "XFSZ");
        assert_eq!(signal_name(4242), "signal 4242");
    }
}
