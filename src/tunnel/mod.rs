//! SSH Reverse Tunnel
//!
//! Owns the optional tunnel that exposes the local listener on a remote
//! host: setup, health check and bounded reconnect with exponential backoff.
//!
//! The SSH layer is reached through [`TunnelConnector`] so the state machine
//! can run against any client that can open one connection and request one
//! remote port-forward. The production connector is
//! [`crate::ssh::RusshConnector`].
//!
//! # Invariants
//! - The handle slot holds a connection and its remote listener together,
//!   or nothing. It is replaced wholesale, never mutated in place.
//! - The slot is only written while holding the reconnect mutex.
//! - At most one reconnect sequence runs per session; a second caller waits
//!   on the mutex and then finds the tunnel healthy.

pub mod keys;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{seconds, SshSettings, SshTarget};
use crate::error::{ConfigError, TunnelError};
use crate::lifecycle::Lifecycle;
use crate::metrics::MetricsAggregator;

/// Opens SSH client connections.
#[async_trait]
pub trait TunnelConnector: Send + Sync + 'static {
    /// Connect and authenticate. The caller applies the handshake timeout.
    async fn connect(
        &self,
        target: &SshTarget,
        settings: &SshSettings,
    ) -> Result<Box<dyn SshConnection>, TunnelError>;
}

/// An authenticated SSH client connection.
#[async_trait]
pub trait SshConnection: Send + Sync {
    /// Ask the server to listen on `remote_host:remote_port` and forward
    /// every accepted connection to `local_host:local_port`.
    async fn forward_remote_port(
        &self,
        remote_host: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Result<Box<dyn RemoteListener>, TunnelError>;

    fn is_closed(&self) -> bool;

    /// Request disconnect; does not wait for it.
    async fn close(&self);

    /// Resolve once the connection is fully closed.
    async fn wait_closed(&self);
}

/// The server-side listener created by a remote port-forward.
#[async_trait]
pub trait RemoteListener: Send + Sync {
    /// Port actually bound on the remote host
    fn bound_port(&self) -> u16;

    async fn close(&self);
}

/// An open tunnel: connection plus the listener it returned.
pub struct TunnelHandle {
    connection: Box<dyn SshConnection>,
    listener: Box<dyn RemoteListener>,
}

impl TunnelHandle {
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn bound_port(&self) -> u16 {
        self.listener.bound_port()
    }

    /// Close the remote listener, then the connection, waiting at most
    /// `wait` for the connection to go away.
    pub async fn close(&self, wait: Duration) {
        self.listener.close().await;
        if self.connection.is_closed() {
            return;
        }
        self.connection.close().await;
        if tokio::time::timeout(wait, self.connection.wait_closed())
            .await
            .is_err()
        {
            debug!("SSH connection wait_closed timed out after {:?}", wait);
        }
    }
}

/// Lifecycle controller for the optional SSH tunnel.
pub struct TunnelController {
    settings: Option<SshSettings>,
    local: Mutex<(String, u16)>,
    connector: Arc<dyn TunnelConnector>,
    handle: Mutex<Option<Arc<TunnelHandle>>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    lifecycle: Arc<Lifecycle>,
    metrics: Arc<MetricsAggregator>,
}

impl TunnelController {
    /// `settings` is `Some` only in tunneled mode.
    pub fn new(
        settings: Option<SshSettings>,
        local_host: String,
        local_port: u16,
        connector: Arc<dyn TunnelConnector>,
        lifecycle: Arc<Lifecycle>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            settings,
            local: Mutex::new((local_host, local_port)),
            connector,
            handle: Mutex::new(None),
            reconnect_lock: tokio::sync::Mutex::new(()),
            lifecycle,
            metrics,
        }
    }

    pub fn is_tunneled(&self) -> bool {
        self.settings.is_some()
    }

    pub fn reconnect_on_disconnect(&self) -> bool {
        self.settings
            .as_ref()
            .map(|s| s.reconnect_on_disconnect)
            .unwrap_or(false)
    }

    /// Local endpoint the tunnel forwards to. Updated once the listener is bound.
    pub fn set_local_endpoint(&self, host: String, port: u16) {
        *self.local.lock() = (host, port);
    }

    /// Healthy means nothing to gate on: plain mode, or an open tunnel.
    pub fn is_healthy(&self) -> bool {
        if !self.is_tunneled() {
            return true;
        }
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_closed())
            .unwrap_or(false)
    }

    /// Remote port of the current tunnel, if one is open.
    pub fn remote_port(&self) -> Option<u16> {
        self.handle.lock().as_ref().map(|h| h.bound_port())
    }

    /// Establish the tunnel once, replacing whatever was there before.
    pub async fn setup_tunnel(&self) -> Result<(), TunnelError> {
        let _guard = self.reconnect_lock.lock().await;
        self.establish().await
    }

    /// Bring a dead tunnel back, retrying with exponential backoff.
    ///
    /// No-op when the session is not running or the tunnel is healthy.
    /// Exhausting every attempt halts the session.
    pub async fn reconnect(&self) -> Result<(), TunnelError> {
        let _guard = self.reconnect_lock.lock().await;
        let Some(settings) = self.settings.as_ref() else {
            return Ok(());
        };
        if !self.lifecycle.is_running() || self.is_healthy() {
            return Ok(());
        }

        warn!("SSH connection lost, attempting to reconnect...");
        let attempts = settings.reconnect_attempts;
        let factor = settings.reconnect_backoff_factor;
        let mut delay = settings.initial_backoff();
        let shutdown = self.lifecycle.shutdown_token();

        for attempt in 1..=attempts {
            match self.establish().await {
                Ok(()) => {
                    info!("SSH tunnel reconnected successfully (attempt {})", attempt);
                    self.metrics.record_reconnect(true);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e);
                    self.metrics.record_reconnect(false);
                }
            }

            if attempt < attempts {
                debug!("Waiting {:?} before next reconnect attempt", delay);
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Session closing, abandoning reconnect");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = seconds(delay.as_secs_f64() * factor);
            }
        }

        error!("Could not reconnect SSH tunnel. Stopping server.");
        self.lifecycle.halt();
        Err(TunnelError::Exhausted { attempts })
    }

    /// Tear the tunnel down. Tolerates a tunnel that never came up.
    pub async fn close(&self, wait: Duration) {
        let _guard = self.reconnect_lock.lock().await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.close(wait).await;
            info!("SSH tunnel closed");
        }
    }

    async fn establish(&self) -> Result<(), TunnelError> {
        let settings = self
            .settings
            .as_ref()
            .ok_or_else(|| ConfigError("SSH tunnel is not configured".to_string()))?;
        let target = settings.require()?;
        keys::check_key_file(&target.key_path, settings.check_key_permissions)?;

        let previous = self.handle.lock().take();
        if let Some(previous) = previous {
            debug!("Discarding previous SSH connection");
            previous.close(Duration::ZERO).await;
        }

        debug!(
            "Setting up SSH tunnel to {}@{}:{}",
            target.user, target.host, target.port
        );
        let limit = settings.handshake_timeout();
        let connection = self
            .bounded("handshake", limit, self.connector.connect(&target, settings))
            .await?;

        let (local_host, local_port) = self.local.lock().clone();
        let forward = connection.forward_remote_port(
            &target.remote_bind_host,
            target.remote_bind_port,
            &local_host,
            local_port,
        );
        let listener = match self.bounded("remote forward request", limit, forward).await {
            Ok(listener) => listener,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        info!(
            "SSH tunnel established to {}: {}:{} -> {}:{}",
            target.host,
            target.remote_bind_host,
            listener.bound_port(),
            local_host,
            local_port
        );
        *self.handle.lock() = Some(Arc::new(TunnelHandle {
            connection,
            listener,
        }));
        Ok(())
    }

    /// Run one SSH round trip under `limit`, giving up as soon as the
    /// session starts shutting down.
    async fn bounded<T, F>(&self, what: &str, limit: Duration, call: F) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        let shutdown = self.lifecycle.shutdown_token();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                Err(TunnelError::ConnectFailed("session is shutting down".to_string()))
            }
            result = tokio::time::timeout(limit, call) => match result {
                Ok(result) => result.map_err(normalize),
                Err(_) => Err(TunnelError::ConnectFailed(format!(
                    "{} timed out after {:?}",
                    what, limit
                ))),
            },
        }
    }
}

/// Everything the SSH layer reports becomes a connect failure.
fn normalize(err: TunnelError) -> TunnelError {
    match err {
        TunnelError::ConnectFailed(_) => err,
        other => TunnelError::ConnectFailed(other.to_string()),
    }
}
