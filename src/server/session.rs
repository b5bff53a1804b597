//! Handle to a started server

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::debug;

use super::ServerInner;
use crate::lifecycle::SessionState;
use crate::metrics::MetricsSnapshot;
use crate::tunnel::TunnelController;

/// A running server. Closed by [`ServerSession::close`], by
/// [`ServerSession::run_until`], or on a best-effort basis when dropped.
pub struct ServerSession {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
}

impl ServerSession {
    pub(super) fn new(inner: Arc<ServerInner>, local_addr: SocketAddr) -> Self {
        Self { inner, local_addr }
    }

    /// Stop serving and release everything. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Serve until `until` completes, then close.
    pub async fn run_until<F: Future>(self, until: F) -> F::Output {
        let output = until.await;
        self.close().await;
        output
    }

    /// Resolves when the session stops accepting, either through `close`
    /// or because the tunnel could not be reconnected.
    pub fn halted(&self) -> WaitForCancellationFutureOwned {
        self.inner.lifecycle.shutdown_token().cancelled_owned()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port, resolved when the configured port was 0.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.get_metrics()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset_metrics();
    }

    /// Fold pending metrics into the snapshot without waiting for the interval.
    pub fn flush_metrics(&self) {
        self.inner.metrics.flush_now();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lifecycle.state()
    }

    pub fn tunnel(&self) -> &Arc<TunnelController> {
        &self.inner.tunnel
    }

    /// Number of connections currently admitted.
    pub fn active_connections(&self) -> usize {
        self.inner.active_count()
    }

    #[cfg(test)]
    pub(super) fn inner(&self) -> &Arc<ServerInner> {
        &self.inner
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if self.inner.lifecycle.state() == SessionState::Closed {
            return;
        }
        // No runtime, nothing left to drive the teardown
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!("ServerSession dropped while open, closing in background");
        let inner = self.inner.clone();
        runtime.spawn(async move {
            inner.close().await;
        });
    }
}
