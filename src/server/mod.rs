//! TCP server with admission control and an optional SSH reverse tunnel
//!
//! # Startup
//! 1. Bind the listener and read the real port back (port 0 = ephemeral)
//! 2. In tunneled mode, set up the tunnel; on failure the listener is
//!    dropped before the error is returned
//! 3. Start the accept loop and the metrics flush task
//!
//! # Shutdown
//! `close()` halts the session, signals every active connection, waits up
//! to `close_timeout` for them to finish and then drops whatever handler is
//! still running together with its socket. It then joins the accept loop,
//! closes the tunnel and finally stops the metrics task. Every step
//! tolerates state that was never initialized.

mod connection;
mod handler;
mod session;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ClientError, Disconnect, ServerError};
use crate::lifecycle::{Lifecycle, SessionState};
use crate::metrics::{MetricsAggregator, MetricsLabels};
use crate::ssh::RusshConnector;
use crate::stream::{Gate, GatedReader, GatedWriter, StreamReader, StreamWriter};
use crate::tunnel::{TunnelConnector, TunnelController};

pub use connection::{ActiveConnection, ConnectionId};
pub use handler::ConnectionHandler;
pub use session::ServerSession;

use connection::ConnectionGuard;

/// Delay before accepting again after an accept error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long a force-closed connection gets to release its slot
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A configured, not yet started server.
pub struct BakedServer {
    inner: Arc<ServerInner>,
}

impl BakedServer {
    /// Validate `config` and build a server that tunnels through russh.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_connector(config, Arc::new(RusshConnector))
    }

    /// Like [`BakedServer::new`] with a custom SSH connector.
    pub fn with_connector(
        config: ServerConfig,
        connector: Arc<dyn TunnelConnector>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let ssh = if config.use_ssh() {
            config.ssh.clone()
        } else {
            None
        };
        let ssh_host = ssh.as_ref().and_then(|s| s.ssh_host.clone());

        let lifecycle = Arc::new(Lifecycle::new());
        let metrics = Arc::new(MetricsAggregator::new(
            config.metrics.clone(),
            MetricsLabels::new(&config.host, config.port, ssh_host.as_deref()),
        ));
        let tunnel = Arc::new(TunnelController::new(
            ssh,
            config.host.clone(),
            config.port,
            connector,
            lifecycle.clone(),
            metrics.clone(),
        ));
        let (active_tx, _) = watch::channel(0usize);

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                lifecycle,
                tunnel,
                metrics,
                admission: Mutex::new(HashMap::new()),
                active_tx,
                listener_task: Mutex::new(None),
                next_id: AtomicU64::new(1),
                close_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Bind, bring the tunnel up if configured, and start serving.
    ///
    /// On error everything started so far is torn down again.
    pub async fn start<H: ConnectionHandler>(self, handler: H) -> Result<ServerSession, ServerError> {
        let inner = self.inner;
        inner.lifecycle.transition(SessionState::Starting);

        match inner.clone().start_serving(Arc::new(handler)).await {
            Ok(local) => {
                inner.lifecycle.transition(SessionState::Running);
                Ok(ServerSession::new(inner, local))
            }
            Err(e) => {
                error!("Server startup failed: {}", e);
                inner.teardown().await;
                inner.lifecycle.transition(SessionState::Closed);
                Err(e)
            }
        }
    }
}

pub(crate) struct ServerInner {
    config: ServerConfig,
    lifecycle: Arc<Lifecycle>,
    tunnel: Arc<TunnelController>,
    metrics: Arc<MetricsAggregator>,
    /// Admitted connections; its length is the live connection count
    admission: Mutex<HashMap<ConnectionId, ActiveConnection>>,
    /// Mirrors the admission map length so `close` can wait for zero
    active_tx: watch::Sender<usize>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    close_lock: tokio::sync::Mutex<()>,
}

impl ServerInner {
    async fn start_serving(
        self: Arc<Self>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<SocketAddr, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        self.metrics.set_port(local.port());
        self.tunnel
            .set_local_endpoint(self.config.host.clone(), local.port());
        self.metrics.start();

        if self.tunnel.is_tunneled() {
            // The listener is dropped on error, releasing the port
            self.tunnel.setup_tunnel().await?;
        }

        info!("Server listening on {}", local);
        let task = tokio::spawn(accept_loop(self.clone(), listener, handler));
        *self.listener_task.lock() = Some(task);
        Ok(local)
    }

    /// Check the cap and register the connection in one critical section.
    ///
    /// A halted session admits nothing, so `close` sees every connection
    /// it has to signal.
    fn admit(&self, peer: SocketAddr) -> Option<ActiveConnection> {
        let mut active = self.admission.lock();
        if self.lifecycle.is_halted() {
            return None;
        }
        if let Some(cap) = self.config.max_concurrent_connections {
            if active.len() >= cap {
                return None;
            }
        }
        let conn = ActiveConnection::new(
            ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            peer,
        );
        active.insert(conn.id, conn.clone());
        self.active_tx.send_replace(active.len());
        Some(conn)
    }

    fn release(&self, id: ConnectionId) {
        let mut active = self.admission.lock();
        active.remove(&id);
        self.active_tx.send_replace(active.len());
    }

    fn active_count(&self) -> usize {
        self.admission.lock().len()
    }

    fn active_snapshot(&self) -> Vec<ActiveConnection> {
        self.admission.lock().values().cloned().collect()
    }

    /// Wait up to `limit` for every admitted connection to finish.
    async fn wait_drained(&self, limit: Duration) -> bool {
        let mut rx = self.active_tx.subscribe();
        let drained = tokio::time::timeout(limit, rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        drained
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, handler: &Arc<dyn ConnectionHandler>) {
        let Some(conn) = self.admit(peer) else {
            if self.lifecycle.is_halted() {
                debug!("Dropping connection from {}: server is closing", peer);
                return;
            }
            info!(
                "Rejecting connection from {}: at capacity ({:?})",
                peer, self.config.max_concurrent_connections
            );
            self.metrics.record_rejection();
            // Closing without writing gives the peer a clean EOF
            drop(stream);
            return;
        };
        self.metrics.record_admission();
        debug!("Accepted {} from {}", conn.id, peer);

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let inner = self.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let id = conn.id;
            if let Err(e) = inner.serve_connection(stream, conn, handler).await {
                debug!("{} finished with error: {}", id, e);
            }
        });
    }

    /// Run the handler for one admitted connection.
    ///
    /// Expected disconnects are always swallowed; other handler errors are
    /// returned unless `suppress_client_errors` is set.
    pub(crate) async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        conn: ActiveConnection,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), ClientError> {
        let mut guard = ConnectionGuard::new(self.clone(), conn.id);

        let (read_half, write_half) = stream.into_split();
        let gate = Gate::new(
            self.tunnel.clone(),
            self.config.timing.idle_timeout(),
            conn.shutdown.clone(),
        );
        let reader = GatedReader::new(StreamReader::from_tcp(read_half), gate.clone());
        let writer = GatedWriter::new(StreamWriter::from_tcp(write_half), gate);

        guard.start_clock();
        let result = tokio::select! {
            biased;
            _ = conn.abort.cancelled() => {
                warn!("{} outlived the close timeout; dropping it", conn.id);
                Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection force-closed by server",
                )))
            }
            result = handler.handle(reader, writer) => result,
        };

        let Err(e) = result else {
            return Ok(());
        };
        guard.errors.push(e.kind_name());
        match e.classify() {
            Disconnect::Expected => {
                debug!("{} disconnected: {}", conn.id, e);
                Ok(())
            }
            Disconnect::Unexpected if self.config.suppress_client_errors => {
                debug!("Suppressed error on {}: {}", conn.id, e);
                Ok(())
            }
            Disconnect::Unexpected => {
                error!("Unhandled error on {} from {}: {}", conn.id, conn.peer, e);
                Err(e)
            }
        }
    }

    async fn close(&self) {
        let _guard = self.close_lock.lock().await;
        match self.lifecycle.state() {
            SessionState::Closed => return,
            SessionState::Running => {
                self.lifecycle.transition(SessionState::Closing);
            }
            _ => {}
        }
        info!("Closing server");
        self.teardown().await;
        self.lifecycle.transition(SessionState::Closed);
        info!("Server closed");
    }

    /// Every step is safe to run on partially started state.
    async fn teardown(&self) {
        self.lifecycle.halt();

        let active = self.active_snapshot();
        if !active.is_empty() {
            debug!("Signalling {} active connection(s)", active.len());
            for conn in &active {
                conn.shutdown.cancel();
            }
            let wait = self.config.timing.close_timeout();
            if !self.wait_drained(wait).await {
                let stuck = self.active_snapshot();
                warn!(
                    "{} connection(s) still active after {:?}; force-closing",
                    stuck.len(),
                    wait
                );
                for conn in &stuck {
                    conn.abort.cancel();
                }
                if !self.wait_drained(FORCE_CLOSE_GRACE).await {
                    error!(
                        "{} connection(s) did not release their slot",
                        self.active_count()
                    );
                }
            }
        }

        let task = self.listener_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        self.tunnel
            .close(self.config.timing.ssh_close_timeout())
            .await;
        self.metrics.stop().await;
    }
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
) {
    let shutdown = inner.lifecycle.shutdown_token();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => inner.on_accept(stream, peer, &handler),
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
}
