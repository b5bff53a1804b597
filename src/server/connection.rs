//! Per-connection bookkeeping

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::ServerInner;

/// Session-unique connection id, assigned in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An admitted connection, as tracked by the server.
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub since: Instant,
    /// Cancelled by the server to close this connection's transport
    pub shutdown: CancellationToken,
    /// Cancelled once the close grace period ran out; drops the handler
    /// together with its socket
    pub abort: CancellationToken,
}

impl ActiveConnection {
    pub(super) fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            since: Instant::now(),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }
}

/// Records the outcome and frees the admission slot when dropped, so a
/// panicking or cancelled handler still releases it.
pub(super) struct ConnectionGuard {
    inner: Arc<ServerInner>,
    id: ConnectionId,
    started: Instant,
    pub(super) errors: Vec<String>,
}

impl ConnectionGuard {
    pub(super) fn new(inner: Arc<ServerInner>, id: ConnectionId) -> Self {
        Self {
            inner,
            id,
            started: Instant::now(),
            errors: Vec::new(),
        }
    }

    /// Restart the duration clock right before the handler runs.
    pub(super) fn start_clock(&mut self) {
        self.started = Instant::now();
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let duration = self.started.elapsed();
        self.inner
            .metrics
            .record_connection(duration, std::mem::take(&mut self.errors));
        self.inner.release(self.id);
    }
}
