//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::*;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::error::SshError;
use crate::config::{SshSettings, SshTarget};

/// Where forwarded-tcpip channels are bridged to. Filled in once the
/// remote forward is requested.
pub type ForwardTarget = Arc<Mutex<Option<(String, u16)>>>;

/// Connects and authenticates with a private key.
pub struct SshClient {
    target: SshTarget,
    known_hosts: Option<PathBuf>,
    config: client::Config,
}

impl SshClient {
    pub fn new(target: SshTarget, settings: &SshSettings) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: settings.keepalive(),
            keepalive_max: settings.keepalive_count_max,
            ..Default::default()
        };
        Self {
            target,
            known_hosts: settings.known_hosts_path(),
            config,
        }
    }

    /// Connect to the SSH server and return the authenticated handle.
    ///
    /// No timeout is applied here; the tunnel controller bounds the whole call.
    pub async fn connect(
        self,
        forward_to: ForwardTarget,
    ) -> Result<client::Handle<ClientHandler>, SshError> {
        let addr = format!("{}:{}", self.target.host, self.target.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let handler = ClientHandler {
            host: self.target.host.clone(),
            port: self.target.port,
            known_hosts: self.known_hosts,
            forward_to,
        };

        let mut handle = client::connect(Arc::new(self.config), socket_addr, handler)
            .await
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        let key = russh::keys::load_secret_key(&self.target.key_path, None)
            .map_err(|e| SshError::KeyError(e.to_string()))?;
        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

        let authenticated = handle
            .authenticate_publickey(&self.target.user, key_with_hash)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful as {}", self.target.user);
        Ok(handle)
    }
}

/// Client handler for russh callbacks
///
/// Verifies the host key and bridges every forwarded-tcpip channel the
/// server opens to the local listener.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// None accepts any host key
    known_hosts: Option<PathBuf>,
    forward_to: ForwardTarget,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(path) = &self.known_hosts else {
            debug!("Host key checking disabled for {}:{}", self.host, self.port);
            return Ok(true);
        };

        match russh::keys::check_known_hosts_path(&self.host, self.port, server_public_key, path) {
            Ok(true) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    "Unknown host key for {}:{} (not in {})",
                    self.host,
                    self.port,
                    path.display()
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{}",
                    self.host, self.port
                )))
            }
            Err(e) => {
                warn!("Host key check failed for {}:{}: {}", self.host, self.port, e);
                Err(SshError::HostKeyRejected(e.to_string()))
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some((local_host, local_port)) = self.forward_to.lock().clone() else {
            warn!("Forwarded channel arrived before any forward was requested");
            return Ok(());
        };

        // Must not block the SSH event loop
        tokio::spawn(async move {
            if let Err(e) = bridge_forwarded_channel(channel, &local_host, local_port).await {
                debug!(
                    "Forwarded connection to {}:{} ended with error: {}",
                    local_host, local_port, e
                );
            }
        });

        Ok(())
    }
}

/// Pump bytes between a forwarded channel and a fresh local connection.
async fn bridge_forwarded_channel(
    channel: Channel<client::Msg>,
    local_host: &str,
    local_port: u16,
) -> Result<(), SshError> {
    let mut local = TcpStream::connect((local_host, local_port))
        .await
        .map_err(|e| {
            SshError::ConnectionFailed(format!(
                "Failed to connect to {}:{}: {}",
                local_host, local_port, e
            ))
        })?;
    if let Err(e) = local.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let mut remote = channel.into_stream();
    let (up, down) = tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    debug!(
        "Forwarded connection finished: {} bytes up, {} bytes down",
        up, down
    );
    Ok(())
}
