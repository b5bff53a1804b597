//! russh-backed tunnel connector

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::client::{ForwardTarget, SshClient};
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use crate::config::{SshSettings, SshTarget};
use crate::error::TunnelError;
use crate::tunnel::{RemoteListener, SshConnection, TunnelConnector};

/// Production [`TunnelConnector`]: one russh client per connect call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

#[async_trait]
impl TunnelConnector for RusshConnector {
    async fn connect(
        &self,
        target: &SshTarget,
        settings: &SshSettings,
    ) -> Result<Box<dyn SshConnection>, TunnelError> {
        let forward_to: ForwardTarget = Arc::new(Mutex::new(None));
        let label = format!("{}@{}:{}", target.user, target.host, target.port);
        let handle = SshClient::new(target.clone(), settings)
            .connect(forward_to.clone())
            .await?;
        let controller = spawn_handle_owner_task(handle, label);
        Ok(Box::new(RusshConnection {
            controller,
            forward_to,
        }))
    }
}

struct RusshConnection {
    controller: HandleController,
    forward_to: ForwardTarget,
}

#[async_trait]
impl SshConnection for RusshConnection {
    async fn forward_remote_port(
        &self,
        remote_host: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Result<Box<dyn RemoteListener>, TunnelError> {
        // Set before the request so no forwarded channel can beat it
        *self.forward_to.lock() = Some((local_host.to_string(), local_port));

        let bound = self
            .controller
            .tcpip_forward(remote_host, u32::from(remote_port))
            .await?;
        let bound_port = u16::try_from(bound).map_err(|_| {
            TunnelError::ConnectFailed(format!("server reported invalid port {}", bound))
        })?;
        debug!("Remote forward bound on {}:{}", remote_host, bound_port);

        Ok(Box::new(RusshListener {
            controller: self.controller.clone(),
            address: remote_host.to_string(),
            port: bound_port,
        }))
    }

    fn is_closed(&self) -> bool {
        self.controller.is_closed()
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }

    async fn wait_closed(&self) {
        self.controller.closed().await;
    }
}

struct RusshListener {
    controller: HandleController,
    address: String,
    port: u16,
}

#[async_trait]
impl RemoteListener for RusshListener {
    fn bound_port(&self) -> u16 {
        self.port
    }

    async fn close(&self) {
        if self.controller.is_closed() {
            return;
        }
        if let Err(e) = self
            .controller
            .cancel_tcpip_forward(&self.address, u32::from(self.port))
            .await
        {
            warn!(
                "Failed to cancel remote forward {}:{}: {}",
                self.address, self.port, e
            );
        }
    }
}
