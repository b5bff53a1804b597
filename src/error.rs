//! Error types

use std::io;

use thiserror::Error;

/// Invalid constructor arguments or incomplete SSH settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Problems with the SSH private key file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyFileError {
    #[error("SSH key file not found: {0}")]
    NotFound(String),

    #[error("Unprotected private key file {path}! Permissions are too open: {mode:03o}")]
    Insecure { path: String, mode: u32 },
}

/// Tunnel lifecycle failures.
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    KeyFile(#[from] KeyFileError),

    /// A single setup attempt failed (handshake, timeout or forward request)
    #[error("SSH connection failed: {0}")]
    ConnectFailed(String),

    /// Every reconnect attempt failed; the session stops itself
    #[error("Could not reconnect SSH tunnel after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// Tunnel is down and automatic reconnect is disabled
    #[error("SSH connection is closed and reconnect is disabled")]
    Disconnected,
}

/// Errors surfaced by the gated stream wrappers.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl StreamError {
    pub fn is_tunnel_disconnect(&self) -> bool {
        matches!(self, StreamError::Tunnel(TunnelError::Disconnected))
    }
}

/// Errors returned by a connection handler.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Operation timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("{0}")]
    Other(String),
}

/// How a handler failure should be treated by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Ordinary client departure: always swallowed
    Expected,
    /// A defect in the handler or its peer
    Unexpected,
}

impl ClientError {
    pub fn other(msg: impl Into<String>) -> Self {
        ClientError::Other(msg.into())
    }

    /// Short type-like name recorded in metrics instead of the message.
    pub fn kind_name(&self) -> String {
        match self {
            ClientError::Stream(StreamError::Io(e)) | ClientError::Io(e) => {
                format!("{:?}", e.kind())
            }
            ClientError::Stream(StreamError::Tunnel(e)) => tunnel_kind_name(e).to_string(),
            ClientError::Timeout(_) => "Timeout".to_string(),
            ClientError::Other(_) => "Other".to_string(),
        }
    }

    pub fn classify(&self) -> Disconnect {
        match self {
            ClientError::Timeout(_) => Disconnect::Expected,
            ClientError::Stream(StreamError::Io(e)) | ClientError::Io(e) => classify_io(e),
            ClientError::Stream(StreamError::Tunnel(TunnelError::Disconnected)) => {
                Disconnect::Expected
            }
            _ => Disconnect::Unexpected,
        }
    }
}

fn classify_io(err: &io::Error) -> Disconnect {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => Disconnect::Expected,
        _ => Disconnect::Unexpected,
    }
}

fn tunnel_kind_name(err: &TunnelError) -> &'static str {
    match err {
        TunnelError::Config(_) => "ConfigError",
        TunnelError::KeyFile(_) => "KeyFileError",
        TunnelError::ConnectFailed(_) => "TunnelConnectError",
        TunnelError::Exhausted { .. } => "TunnelExhaustedError",
        TunnelError::Disconnected => "TunnelDisconnectedError",
    }
}

/// Errors returned by `BakedServer::new` and `BakedServer::start`.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl From<KeyFileError> for ServerError {
    fn from(err: KeyFileError) -> Self {
        ServerError::Tunnel(TunnelError::KeyFile(err))
    }
}
