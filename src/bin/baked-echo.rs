//! baked-echo - uppercase echo server on top of bakedserver
//!
//! Reads lines and writes them back in upper case. With `--mode ssh` the
//! listener is also published on a remote host through an SSH reverse tunnel.

use std::path::PathBuf;

use bakedserver::{
    init_logging, BakedServer, ClientError, ReadTransport, ServerConfig, SshSettings,
    TimingConfig, WrappedReader, WrappedWriter, WriteTransport,
};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Tcp,
    Ssh,
}

#[derive(Parser, Debug)]
#[command(
    name = "baked-echo",
    about = "Uppercase echo server with an optional SSH reverse tunnel",
    version,
    long_about = "Serves an uppercase line echo on a local port.\n\n\
                  Examples:\n  \
                  # Plain TCP on an ephemeral port\n  \
                  baked-echo --port 0\n\n  \
                  # Publish port 8000 as bastion:9000\n  \
                  baked-echo --port 8000 --mode ssh \\\n    \
                  --ssh-host bastion --ssh-user deploy --ssh-key ~/.ssh/id_ed25519 \\\n    \
                  --remote-bind-host 0.0.0.0 --remote-bind-port 9000"
)]
struct Cli {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1", env = "BAKED_HOST")]
    host: String,

    /// Bind port (0 = ephemeral)
    #[arg(short, long, default_value_t = 0, env = "BAKED_PORT")]
    port: u16,

    #[arg(long, value_enum, default_value_t = Mode::Tcp)]
    mode: Mode,

    /// JSON config file; command line flags are ignored when given
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds a read may stay idle before the connection is treated as done
    #[arg(long)]
    idle_timeout: Option<f64>,

    /// Admission cap
    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long, env = "BAKED_SSH_HOST")]
    ssh_host: Option<String>,

    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    #[arg(long, env = "BAKED_SSH_USER")]
    ssh_user: Option<String>,

    /// Private key used for authentication
    #[arg(long, env = "BAKED_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// known_hosts file; host keys are not checked without it
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1")]
    remote_bind_host: String,

    #[arg(long)]
    remote_bind_port: Option<u16>,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        if let Some(path) = &self.config {
            return Ok(ServerConfig::from_json_file(path)?);
        }

        let mut config = ServerConfig::new(self.host, self.port);
        if let Some(max) = self.max_connections {
            config = config.with_max_connections(max);
        }
        if let Some(idle) = self.idle_timeout {
            config = config.with_timing(TimingConfig::default().with_idle_timeout(idle));
        }
        if self.mode == Mode::Ssh {
            let ssh = SshSettings {
                ssh_host: self.ssh_host,
                ssh_port: self.ssh_port,
                ssh_user: self.ssh_user,
                ssh_key_path: self.ssh_key,
                remote_bind_host: Some(self.remote_bind_host),
                remote_bind_port: self.remote_bind_port,
                known_hosts: self.known_hosts,
                ..SshSettings::defaults()
            };
            config = config.with_ssh(ssh);
        }
        Ok(config)
    }
}

async fn echo_upper(mut reader: WrappedReader, mut writer: WrappedWriter) -> Result<(), ClientError> {
    let peer = writer.peer_addr().ok();
    loop {
        let line = reader.read_line().await?;
        if line.is_empty() {
            break;
        }
        writer.write(&line.to_ascii_uppercase()).await?;
        writer.drain().await?;
    }
    info!("Client {:?} done", peer);
    writer.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = Cli::parse().into_config()?;
    let server = BakedServer::new(config)?;
    let session = server.start(echo_upper).await?;
    info!("baked-echo listening on {}", session.local_addr());
    if let Some(port) = session.tunnel().remote_port() {
        info!("Reachable through the SSH tunnel on remote port {}", port);
    }

    let halted = session.halted();
    let snapshot = {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
            }
            _ = halted => {
                warn!("Server stopped itself");
            }
        }
        session.close().await;
        session.flush_metrics();
        session.get_metrics()
    };

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
