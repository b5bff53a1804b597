//! Tunnel-aware transport decorators
//!
//! Every delegated call first makes sure the tunnel is usable: a dead
//! tunnel is reconnected inline, or the call fails with
//! `TunnelError::Disconnected` when reconnecting is switched off. In plain
//! mode the tunnel is always healthy and the check is a single branch.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ReadTransport, WriteTransport};
use crate::error::{StreamError, TunnelError};
use crate::tunnel::TunnelController;

/// Per-connection gating state shared by the reader and writer.
#[derive(Clone)]
pub struct Gate {
    tunnel: Arc<TunnelController>,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl Gate {
    /// `shutdown` fires when the server closes this connection.
    pub fn new(
        tunnel: Arc<TunnelController>,
        idle_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tunnel,
            idle_timeout,
            shutdown,
        }
    }

    /// Make sure the tunnel is up before delegating.
    async fn ensure_tunnel(&self) -> Result<(), StreamError> {
        if self.tunnel.is_healthy() {
            return Ok(());
        }
        if !self.tunnel.reconnect_on_disconnect() {
            return Err(TunnelError::Disconnected.into());
        }
        self.tunnel.reconnect().await?;
        Ok(())
    }

    /// Synchronous variant for queries that cannot wait on a reconnect.
    ///
    /// With reconnecting enabled the reconnect is started in the background
    /// and the query proceeds.
    fn ensure_tunnel_now(&self) -> Result<(), StreamError> {
        if self.tunnel.is_healthy() {
            return Ok(());
        }
        if !self.tunnel.reconnect_on_disconnect() {
            return Err(TunnelError::Disconnected.into());
        }
        let tunnel = self.tunnel.clone();
        tokio::spawn(async move {
            if let Err(e) = tunnel.reconnect().await {
                debug!("Background reconnect failed: {}", e);
            }
        });
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.shutdown.is_cancelled() {
            return Err(aborted());
        }
        Ok(())
    }

    /// Run a write-side call that fails with `ConnectionAborted` as soon as
    /// the server closes the connection, even if it is already blocked on
    /// a peer that stopped reading.
    async fn abortable<F>(&self, call: F) -> Result<(), StreamError>
    where
        F: Future<Output = Result<(), StreamError>> + Send,
    {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(aborted()),
            result = call => result,
        }
    }

    /// Run a byte read, cut short by the idle timeout or server shutdown.
    /// Both end the read with an empty buffer.
    async fn bounded_read<F>(&self, op: &'static str, read: F) -> Result<Vec<u8>, StreamError>
    where
        F: Future<Output = Result<Vec<u8>, StreamError>> + Send,
    {
        let timed = async {
            match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Idle timeout ({:?}) on {}; treating as EOF", limit, op);
                        Ok(Vec::new())
                    }
                },
                None => read.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Ok(Vec::new()),
            result = timed => result,
        }
    }
}

fn aborted() -> StreamError {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server").into()
}

pub struct GatedReader<T> {
    inner: T,
    gate: Gate,
}

impl<T: ReadTransport> GatedReader<T> {
    pub fn new(inner: T, gate: Gate) -> Self {
        Self { inner, gate }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: ReadTransport> ReadTransport for GatedReader<T> {
    async fn read(&mut self, max: usize) -> Result<Vec<u8>, StreamError> {
        self.gate.ensure_tunnel().await?;
        let gate = &self.gate;
        gate.bounded_read("read", self.inner.read(max)).await
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, StreamError> {
        self.gate.ensure_tunnel().await?;
        let gate = &self.gate;
        gate.bounded_read("read_line", self.inner.read_line()).await
    }

    async fn read_until(&mut self, delim: u8) -> Result<Vec<u8>, StreamError> {
        self.gate.ensure_tunnel().await?;
        let gate = &self.gate;
        gate.bounded_read("read_until", self.inner.read_until(delim))
            .await
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        self.gate.ensure_tunnel().await?;
        let gate = &self.gate;
        gate.bounded_read("read_exact", self.inner.read_exact(n)).await
    }

    fn at_eof(&self) -> bool {
        self.inner.at_eof()
    }
}

pub struct GatedWriter<T> {
    inner: T,
    gate: Gate,
}

impl<T: WriteTransport> GatedWriter<T> {
    pub fn new(inner: T, gate: Gate) -> Self {
        Self { inner, gate }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: WriteTransport> WriteTransport for GatedWriter<T> {
    async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.gate.ensure_open()?;
        self.gate.ensure_tunnel().await?;
        let gate = &self.gate;
        gate.abortable(self.inner.write(data)).await
    }

    async fn drain(&mut self) -> Result<(), StreamError> {
        self.gate.ensure_open()?;
        self.gate.ensure_tunnel().await?;
        let gate = &self.gate;
        gate.abortable(self.inner.drain()).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.gate.ensure_tunnel().await?;
        let gate = &self.gate;
        gate.abortable(self.inner.close()).await
    }

    fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }

    fn peer_addr(&self) -> Result<SocketAddr, StreamError> {
        self.gate.ensure_tunnel_now()?;
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        self.gate.ensure_tunnel_now()?;
        self.inner.local_addr()
    }

    fn can_write_eof(&self) -> bool {
        if self.gate.ensure_tunnel_now().is_err() {
            return false;
        }
        self.inner.can_write_eof()
    }

    async fn write_eof(&mut self) -> Result<(), StreamError> {
        self.gate.ensure_open()?;
        self.gate.ensure_tunnel().await?;
        let gate = &self.gate;
        gate.abortable(self.inner.write_eof()).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::config::{MetricsConfig, SshSettings};
    use crate::lifecycle::{Lifecycle, SessionState};
    use crate::metrics::{MetricsAggregator, MetricsLabels};
    use crate::stream::{StreamReader, StreamWriter};
    use crate::tunnel::testing::{FakeConnector, FakeState};

    fn plain_tunnel() -> Arc<TunnelController> {
        let (connector, _) = FakeConnector::new();
        Arc::new(TunnelController::new(
            None,
            "localhost".into(),
            0,
            connector,
            Arc::new(Lifecycle::new()),
            Arc::new(MetricsAggregator::new(
                MetricsConfig::default(),
                MetricsLabels::new("localhost", 0, None),
            )),
        ))
    }

    /// A tunneled controller that was never set up, so it is unhealthy.
    fn down_tunnel(
        reconnect: bool,
        key: &tempfile::NamedTempFile,
    ) -> (Arc<TunnelController>, Arc<FakeState>) {
        let mut settings = SshSettings::new("bastion", "deploy", key.path(), "127.0.0.1", 9000);
        settings.reconnect_on_disconnect = reconnect;
        let (connector, state) = FakeConnector::new();
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.transition(SessionState::Starting);
        lifecycle.transition(SessionState::Running);
        let controller = Arc::new(TunnelController::new(
            Some(settings),
            "localhost".into(),
            8000,
            connector,
            lifecycle,
            Arc::new(MetricsAggregator::new(
                MetricsConfig::default(),
                MetricsLabels::new("localhost", 8000, Some("bastion")),
            )),
        ));
        (controller, state)
    }

    fn pipe(
        gate: Gate,
    ) -> (
        GatedReader<StreamReader<DuplexStream>>,
        GatedWriter<StreamWriter<DuplexStream>>,
        DuplexStream,
        DuplexStream,
    ) {
        let (ours_in, theirs_out) = duplex(256);
        let (ours_out, theirs_in) = duplex(256);
        (
            GatedReader::new(StreamReader::new(ours_in), gate.clone()),
            GatedWriter::new(StreamWriter::new(ours_out), gate),
            theirs_out,
            theirs_in,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_returns_empty() {
        let gate = Gate::new(
            plain_tunnel(),
            Some(Duration::from_millis(100)),
            CancellationToken::new(),
        );
        let (mut reader, _writer, _peer_out, _peer_in) = pipe(gate);

        let started = tokio::time::Instant::now();
        let data = reader.read(64).await.unwrap();
        assert!(data.is_empty());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_mid_line_keeps_bytes() {
        use tokio::io::AsyncWriteExt;

        let gate = Gate::new(
            plain_tunnel(),
            Some(Duration::from_millis(100)),
            CancellationToken::new(),
        );
        let (mut reader, _writer, mut peer_out, _peer_in) = pipe(gate);

        peer_out.write_all(b"hel").await.unwrap();
        assert!(reader.read_line().await.unwrap().is_empty());

        peer_out.write_all(b"lo\n").await.unwrap();
        assert_eq!(reader.read_line().await.unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_plain_mode_delegates() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let gate = Gate::new(plain_tunnel(), None, CancellationToken::new());
        let (mut reader, mut writer, mut peer_out, mut peer_in) = pipe(gate);

        peer_out.write_all(b"ping\n").await.unwrap();
        assert_eq!(reader.read_line().await.unwrap(), b"ping\n");

        writer.write(b"pong").await.unwrap();
        writer.drain().await.unwrap();
        let mut buf = [0u8; 4];
        peer_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_reconnect_disabled_fails_without_handshake() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let (tunnel, state) = down_tunnel(false, &key);
        let gate = Gate::new(tunnel, None, CancellationToken::new());
        let (mut reader, mut writer, _peer_out, _peer_in) = pipe(gate);

        let err = reader.read(16).await.unwrap_err();
        assert!(err.is_tunnel_disconnect());
        let err = writer.write(b"x").await.unwrap_err();
        assert!(err.is_tunnel_disconnect());
        // Synchronous queries fail fast too
        assert!(writer.peer_addr().unwrap_err().is_tunnel_disconnect());
        assert!(!writer.can_write_eof());
        // Pure delegation is not gated
        assert!(!writer.is_closing());
        assert!(!reader.at_eof());

        assert_eq!(state.connects(), 0);
    }

    #[tokio::test]
    async fn test_dead_tunnel_reconnects_before_read() {
        use tokio::io::AsyncWriteExt;

        let key = tempfile::NamedTempFile::new().unwrap();
        let (tunnel, state) = down_tunnel(true, &key);
        let gate = Gate::new(tunnel.clone(), None, CancellationToken::new());
        let (mut reader, _writer, mut peer_out, _peer_in) = pipe(gate);

        peer_out.write_all(b"data").await.unwrap();
        assert_eq!(reader.read(4).await.unwrap(), b"data");
        assert_eq!(state.connects(), 1);
        assert!(tunnel.is_healthy());
    }

    #[tokio::test]
    async fn test_server_shutdown_ends_reads_and_aborts_writes() {
        let shutdown = CancellationToken::new();
        let gate = Gate::new(plain_tunnel(), None, shutdown.clone());
        let (mut reader, mut writer, _peer_out, _peer_in) = pipe(gate);

        let pending = tokio::spawn(async move { reader.read(16).await });
        tokio::task::yield_now().await;
        shutdown.cancel();
        assert!(pending.await.unwrap().unwrap().is_empty());

        match writer.write(b"late").await {
            Err(StreamError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionAborted),
            other => panic!("expected ConnectionAborted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_shutdown_interrupts_blocked_drain() {
        let shutdown = CancellationToken::new();
        let gate = Gate::new(plain_tunnel(), None, shutdown.clone());
        // The peer never reads, so the 256 byte pipe fills up
        let (_reader, mut writer, _peer_out, _peer_in) = pipe(gate);

        let blocked = tokio::spawn(async move {
            writer.write(&[b'x'; 64 * 1024]).await?;
            writer.drain().await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(StreamError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionAborted),
            other => panic!("expected ConnectionAborted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inner_access() {
        let gate = Gate::new(plain_tunnel(), None, CancellationToken::new());
        let (reader, mut writer, _peer_out, _peer_in) = pipe(gate);
        assert!(!reader.get_ref().at_eof());
        assert!(writer.get_mut().peer_addr().is_err());
        let _inner: StreamWriter<DuplexStream> = writer.into_inner();
    }
}
