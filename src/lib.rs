//! bakedserver - a TCP server that can expose itself through an SSH reverse tunnel
//!
//! Accepts connections on a local listener, enforces an optional admission
//! cap, hands each connection to a [`ConnectionHandler`] and aggregates
//! connection metrics in the background. In tunneled mode the listener is
//! published on a remote host with an SSH remote port-forward, and a dead
//! tunnel is reconnected with exponential backoff before the next I/O call.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod server;
pub mod ssh;
pub mod stream;
pub mod tunnel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{MetricsConfig, RetentionStrategy, ServerConfig, SshSettings, TimingConfig};
pub use error::{
    ClientError, ConfigError, Disconnect, KeyFileError, ServerError, StreamError, TunnelError,
};
pub use lifecycle::SessionState;
pub use metrics::{ConnectionStats, MetricsLabels, MetricsSnapshot};
pub use server::{ActiveConnection, BakedServer, ConnectionHandler, ConnectionId, ServerSession};
pub use stream::{ReadTransport, WrappedReader, WrappedWriter, WriteTransport};
pub use tunnel::{TunnelConnector, TunnelController};

/// Install the default subscriber: `RUST_LOG` filter (default `info`) and
/// the fmt layer. Does nothing if a subscriber is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
