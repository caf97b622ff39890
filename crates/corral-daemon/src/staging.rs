//! Workdir creation and path-safe source staging.
//!
//! Each session gets one fresh workdir under the configured `basedir`,
//! named with a random 6-character suffix and never removed by the
//! daemon (an external sweeper owns cleanup). Submitted sources are
//! written twice: under `workdir/store/` for the compiler, and under
//! `storedir/<unique>/` as a best-effort archival copy of the run.
//!
//! # Security
//!
//! Client-supplied filenames are treated as hostile. [`create_under`]
//! refuses absolute paths and any `..` traversal that would climb above
//! the staging root, creates intermediate directories with mode 0700,
//! and opens target files create-exclusive with mode 0600.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

/// Prefix of per-session workdir names; a 6-character random suffix
/// follows.
pub const WORKDIR_PREFIX: &str = "corral";

/// Attempts before giving up on a file-descriptor-pressure error.
const STAGE_RETRY_LIMIT: u32 = 64;

/// Pause between retry attempts.
const STAGE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Errors from staging sources into a workdir.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The filename was absolute or traversed above the staging root.
    #[error("source path escapes the staging root: {path}")]
    PathEscape {
        /// Offending relative path.
        path: String,
    },

    /// An I/O error other than a path violation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    fn escape(path: &str) -> Self {
        Self::PathEscape {
            path: path.to_string(),
        }
    }
}

/// One submitted source file, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Client-supplied filename; empty selects the compiler's default.
    pub filename: String,
    /// Accumulated file contents.
    pub bytes: Vec<u8>,
}

/// A session's staging directory.
#[derive(Debug)]
pub struct Workdir {
    /// Absolute path of the directory.
    pub path: PathBuf,
    /// Directory name, also used for the archival copy.
    pub unique_name: String,
}

/// Creates a fresh workdir under `basedir` with mode 0700.
///
/// The directory is kept on disk; cleanup is out of the daemon's hands.
///
/// # Errors
///
/// Returns [`StageError::Io`] if the directory cannot be created.
pub fn create_workdir(basedir: &Path) -> Result<Workdir, StageError> {
    let dir = tempfile::Builder::new()
        .prefix(WORKDIR_PREFIX)
        .rand_bytes(6)
        .tempdir_in(basedir)
        .map_err(|e| StageError::io(format!("create workdir under {}", basedir.display()), e))?;
    let path = dir.keep();

    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| StageError::io("restrict workdir permissions", e))?;

    let unique_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            StageError::io(
                "resolve workdir name",
                std::io::Error::new(std::io::ErrorKind::InvalidData, "workdir has no final component"),
            )
        })?;

    Ok(Workdir { path, unique_name })
}

/// Creates and opens `relative` below `root`, creating intermediate
/// directories as needed.
///
/// Rules: a leading `/` is refused; empty and `.` segments are skipped;
/// `..` steps back one created level and is refused at the root;
/// directories are created mode 0700 (existing ones are fine); the
/// target file is opened write-only, create-exclusive, mode 0600.
///
/// # Errors
///
/// [`StageError::PathEscape`] for absolute paths and over-the-root
/// traversal; [`StageError::Io`] for everything else.
pub fn create_under(root: &Path, relative: &str) -> Result<File, StageError> {
    if relative.starts_with('/') {
        return Err(StageError::escape(relative));
    }

    let mut segments: Vec<&str> = relative.split('/').collect();
    let target = segments.pop().unwrap_or_default();
    if target == ".." {
        return Err(StageError::escape(relative));
    }
    if target.is_empty() || target == "." {
        return Err(StageError::io(
            format!("create '{relative}'"),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing file name"),
        ));
    }

    let mut current = root.to_path_buf();
    let mut depth = 0usize;
    for segment in segments {
        match segment {
            "" | "." => {},
            ".." => {
                if depth == 0 {
                    return Err(StageError::escape(relative));
                }
                depth -= 1;
                current.pop();
            },
            name => {
                current.push(name);
                match DirBuilder::new().mode(0o700).create(&current) {
                    Ok(()) => {},
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {},
                    Err(e) => {
                        return Err(StageError::io(format!("mkdir {}", current.display()), e));
                    },
                }
                depth += 1;
            },
        }
    }

    current.push(target);
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .custom_flags(libc::O_CLOEXEC)
        .open(&current)
        .map_err(|e| StageError::io(format!("create {}", current.display()), e))
}

/// Stages every source into the workdir and mirrors it into the
/// archival store.
///
/// The sandbox copy under `workdir/store/` is mandatory: a path
/// violation or I/O failure ends the session, with a bounded retry when
/// the process is out of file descriptors. The archival copy under
/// `storedir/<unique>/` is best-effort; failures are logged and
/// ignored.
///
/// # Errors
///
/// Returns the first fatal [`StageError`] from the sandbox copy.
pub async fn stage_sources(
    workdir: &Workdir,
    storedir: &Path,
    sources: &[SourceFile],
    default_filename: &str,
) -> Result<(), StageError> {
    for source in sources {
        let filename = if source.filename.is_empty() {
            default_filename
        } else {
            source.filename.as_str()
        };
        debug!(workdir = %workdir.unique_name, %filename, "staging source file");

        let mut file = create_with_retry(&workdir.path, &format!("store/{filename}")).await?;
        file.write_all(&source.bytes)
            .map_err(|e| StageError::io(format!("write store/{filename}"), e))?;

        let archive_path = format!("{}/{filename}", workdir.unique_name);
        match create_under(storedir, &archive_path) {
            Ok(mut archive) => {
                if let Err(error) = archive.write_all(&source.bytes) {
                    warn!(%archive_path, %error, "failed to write archival copy");
                }
            },
            Err(error) => {
                warn!(%archive_path, %error, "failed to create archival copy");
            },
        }
    }
    Ok(())
}

/// [`create_under`] with a bounded retry on fd-pressure errors
/// (`EMFILE`/`ENFILE`/`EAGAIN`), which resolve once some other session
/// releases descriptors.
async fn create_with_retry(root: &Path, relative: &str) -> Result<File, StageError> {
    let mut attempts = 0;
    loop {
        match create_under(root, relative) {
            Err(StageError::Io { ref source, .. })
                if is_fd_pressure(source) && attempts < STAGE_RETRY_LIMIT =>
            {
                attempts += 1;
                tokio::time::sleep(STAGE_RETRY_DELAY).await;
            },
            other => return other,
        }
    }
}

fn is_fd_pressure(error: &std::io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::EAGAIN)
    )
}
