//! Shared helpers for the integration tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bakedserver::config::SshTarget;
use bakedserver::tunnel::{RemoteListener, SshConnection, TunnelConnector};
use bakedserver::{
    ClientError, ReadTransport, SshSettings, TunnelError, WrappedReader, WrappedWriter,
    WriteTransport,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub async fn echo_upper(
    mut reader: WrappedReader,
    mut writer: WrappedWriter,
) -> Result<(), ClientError> {
    loop {
        let line = reader.read_line().await?;
        if line.is_empty() {
            return Ok(());
        }
        writer.write(&line.to_ascii_uppercase()).await?;
        writer.drain().await?;
    }
}

/// Tunnel settings pointing at a throwaway key file.
pub fn ssh_settings(key: &tempfile::NamedTempFile) -> SshSettings {
    let mut settings = SshSettings::new("bastion", "deploy", key.path(), "127.0.0.1", 9000);
    settings.reconnect_backoff = 0.01;
    settings
}

/// In-memory SSH stand-in; the test can drop the connection or make
/// handshakes fail.
#[derive(Default)]
pub struct MockSsh {
    pub handshakes: AtomicUsize,
    pub forwards: AtomicUsize,
    pub refuse: AtomicBool,
    /// Remote forward requests never get an answer
    pub hang_forward: AtomicBool,
    current: Mutex<Option<CancellationToken>>,
}

impl MockSsh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn drop_connection(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            token.cancel();
        }
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn forwards(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }
}

pub struct MockConnector(pub Arc<MockSsh>);

#[async_trait]
impl TunnelConnector for MockConnector {
    async fn connect(
        &self,
        _target: &SshTarget,
        _settings: &SshSettings,
    ) -> Result<Box<dyn SshConnection>, TunnelError> {
        self.0.handshakes.fetch_add(1, Ordering::SeqCst);
        if self.0.refuse.load(Ordering::SeqCst) {
            return Err(TunnelError::ConnectFailed("connection refused".into()));
        }
        let closed = CancellationToken::new();
        *self.0.current.lock() = Some(closed.clone());
        Ok(Box::new(MockConnection {
            ssh: self.0.clone(),
            closed,
        }))
    }
}

struct MockConnection {
    ssh: Arc<MockSsh>,
    closed: CancellationToken,
}

#[async_trait]
impl SshConnection for MockConnection {
    async fn forward_remote_port(
        &self,
        _remote_host: &str,
        remote_port: u16,
        _local_host: &str,
        _local_port: u16,
    ) -> Result<Box<dyn RemoteListener>, TunnelError> {
        self.ssh.forwards.fetch_add(1, Ordering::SeqCst);
        if self.ssh.hang_forward.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(Box::new(MockListener(remote_port)))
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }
}

struct MockListener(u16);

#[async_trait]
impl RemoteListener for MockListener {
    fn bound_port(&self) -> u16 {
        self.0
    }

    async fn close(&self) {}
}
