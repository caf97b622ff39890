//! TCP listener with admission control.
//!
//! The broker accepts connections unconditionally but bounds the number
//! of concurrently-active sessions: each accepted socket is handed to a
//! task that must acquire an owned semaphore permit before any session
//! work starts. Sockets over the limit simply queue on the semaphore.
//! The permit lives inside the session task, so it is returned on every
//! exit path - normal completion, protocol errors, and panics alike.

use std::fs::DirBuilder;
use std::net::SocketAddr;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use corral_core::config::BrokerConfig;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::session;

/// The broker's listening socket plus its admission state.
pub struct Broker {
    config: Arc<BrokerConfig>,
    listener: TcpListener,
    admission: Arc<Semaphore>,
}

impl Broker {
    /// Prepares the staging directories and binds the listen port.
    ///
    /// # Errors
    ///
    /// Returns an error if `basedir`/`storedir` cannot be created or the
    /// port cannot be bound.
    pub async fn bind(config: Arc<BrokerConfig>) -> Result<Self> {
        prepare_dir(&config.system.basedir)
            .context("failed to create basedir, check permission")?;
        prepare_dir(&config.system.storedir)
            .context("failed to create storedir, check permission")?;

        let addr = SocketAddr::from(([0, 0, 0, 0], config.system.listen_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(
            addr = %listener.local_addr().context("listener has no local addr")?,
            max_connections = config.system.max_connections,
            "listening"
        );

        let admission = Arc::new(Semaphore::new(config.system.max_connections));
        Ok(Self {
            config,
            listener,
            admission,
        })
    }

    /// The bound address; useful when the configured port was 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has gone away.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves connections until the task is dropped.
    ///
    /// # Errors
    ///
    /// Never returns `Ok`; accept failures are logged and retried.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "failed to accept connection");
                    continue;
                },
            };
            debug!(%peer, "connection established");

            let config = Arc::clone(&self.config);
            let admission = Arc::clone(&self.admission);
            tokio::spawn(async move {
                // Session work starts only once admitted; the permit
                // drops with this task.
                let Ok(_permit) = admission.acquire_owned().await else {
                    return;
                };
                session::run_session(stream, config).await;
                debug!(%peer, "session ended");
            });
        }
    }
}

/// Creates a staging parent directory with mode 0700, accepting one
/// that already exists.
fn prepare_dir(path: &Path) -> std::io::Result<()> {
    match DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}
