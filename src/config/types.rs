//! Server configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::check::{check_optional, check_that, Requirement};
use crate::error::ConfigError;

/// Upper bound for every configured delay; longer values saturate to it.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Seconds to a `Duration`, saturating at [`MAX_DELAY`]. Overflowing or
/// non-finite products (e.g. a large backoff factor) land on the cap.
pub fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
}

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port (0 = let the OS pick one)
    #[serde(default)]
    pub port: u16,

    /// Admission cap; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_connections: Option<usize>,

    /// Swallow unexpected handler errors instead of propagating them
    #[serde(default = "default_true")]
    pub suppress_client_errors: bool,

    /// SSH reverse tunnel settings; `ssh_host` switches tunneled mode on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshSettings>,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            max_concurrent_connections: None,
            suppress_client_errors: true,
            ssh: None,
            timing: TimingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_concurrent_connections = Some(max);
        self
    }

    pub fn with_ssh(mut self, ssh: SshSettings) -> Self {
        self.ssh = Some(ssh);
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn suppress_client_errors(mut self, suppress: bool) -> Self {
        self.suppress_client_errors = suppress;
        self
    }

    /// True when an SSH host is configured.
    pub fn use_ssh(&self) -> bool {
        self.ssh
            .as_ref()
            .map(|s| s.ssh_host.is_some())
            .unwrap_or(false)
    }

    /// Check constructor-level constraints.
    ///
    /// Missing SSH keys are not checked here: they are reported when the
    /// tunnel is set up, see [`SshSettings::require`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_that(
            &self.host,
            Requirement::NonEmpty,
            format!("Host must be a non-empty string, got {:?}", self.host),
        )?;
        check_optional(
            self.max_concurrent_connections.as_ref(),
            Requirement::Positive,
            "max_concurrent_connections must be a positive integer",
        )?;
        self.timing.validate()?;
        self.metrics.validate()?;
        if let Some(ssh) = &self.ssh {
            ssh.validate()?;
        }
        Ok(())
    }
}

/// SSH tunnel settings
///
/// The required fields are optional at the type level so a partially
/// specified config can be loaded and rejected with a precise message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_bind_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_bind_port: Option<u16>,

    /// known_hosts file to verify the server key against (None = no checking)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<PathBuf>,

    /// Seconds between SSH keepalives
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: f64,

    /// Missed keepalives before the connection is dropped
    #[serde(default = "default_keepalive_count_max")]
    pub keepalive_count_max: usize,

    #[serde(default = "default_true")]
    pub reconnect_on_disconnect: bool,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Initial delay between reconnect attempts, in seconds
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: f64,

    #[serde(default = "default_reconnect_backoff_factor")]
    pub reconnect_backoff_factor: f64,

    /// Reject private keys readable by group/other (unix only)
    #[serde(default)]
    pub check_key_permissions: bool,

    /// Handshake timeout in seconds
    #[serde(default = "default_ssh_tun_timeout")]
    pub ssh_tun_timeout: f64,
}

/// Required SSH parameters, resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub remote_bind_host: String,
    pub remote_bind_port: u16,
}

impl SshSettings {
    pub fn new(
        ssh_host: impl Into<String>,
        ssh_user: impl Into<String>,
        ssh_key_path: impl Into<PathBuf>,
        remote_bind_host: impl Into<String>,
        remote_bind_port: u16,
    ) -> Self {
        Self {
            ssh_host: Some(ssh_host.into()),
            ssh_user: Some(ssh_user.into()),
            ssh_key_path: Some(ssh_key_path.into()),
            remote_bind_host: Some(remote_bind_host.into()),
            remote_bind_port: Some(remote_bind_port),
            ..Self::defaults()
        }
    }

    /// Settings with every optional knob at its default and no target.
    pub fn defaults() -> Self {
        Self {
            ssh_host: None,
            ssh_port: default_ssh_port(),
            ssh_user: None,
            ssh_key_path: None,
            remote_bind_host: None,
            remote_bind_port: None,
            known_hosts: None,
            keepalive_interval: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_count_max(),
            reconnect_on_disconnect: true,
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff: default_reconnect_backoff(),
            reconnect_backoff_factor: default_reconnect_backoff_factor(),
            check_key_permissions: false,
            ssh_tun_timeout: default_ssh_tun_timeout(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_that(
            &self.keepalive_interval,
            Requirement::NonNegative,
            "keepalive_interval must be non-negative",
        )?;
        check_that(
            &self.reconnect_backoff,
            Requirement::NonNegative,
            "reconnect_backoff must be non-negative",
        )?;
        check_that(
            &self.reconnect_backoff_factor,
            Requirement::Positive,
            "reconnect_backoff_factor must be positive",
        )?;
        check_that(
            &self.ssh_tun_timeout,
            Requirement::Positive,
            "ssh_tun_timeout must be positive",
        )
    }

    /// Resolve the required parameters, naming every missing key.
    pub fn require(&self) -> Result<SshTarget, ConfigError> {
        let mut missing = Vec::new();
        if self.ssh_user.is_none() {
            missing.push("ssh_user");
        }
        if self.ssh_key_path.is_none() {
            missing.push("ssh_key_path");
        }
        if self.ssh_host.is_none() {
            missing.push("ssh_host");
        }
        if self.remote_bind_host.is_none() {
            missing.push("remote_bind_host");
        }
        if self.remote_bind_port.is_none() {
            missing.push("remote_bind_port");
        }
        match (
            &self.ssh_host,
            &self.ssh_user,
            &self.ssh_key_path,
            &self.remote_bind_host,
            self.remote_bind_port,
        ) {
            (Some(host), Some(user), Some(key), Some(bind_host), Some(bind_port)) => Ok(SshTarget {
                host: host.clone(),
                port: self.ssh_port,
                user: user.clone(),
                key_path: expand_tilde(key),
                remote_bind_host: bind_host.clone(),
                remote_bind_port: bind_port,
            }),
            _ => Err(ConfigError(format!(
                "Missing SSH config keys: {}",
                missing.join(", ")
            ))),
        }
    }

    pub fn known_hosts_path(&self) -> Option<PathBuf> {
        self.known_hosts.as_deref().map(expand_tilde)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        if self.keepalive_interval > 0.0 {
            Some(seconds(self.keepalive_interval))
        } else {
            None
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        seconds(self.ssh_tun_timeout)
    }

    pub fn initial_backoff(&self) -> Duration {
        seconds(self.reconnect_backoff)
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Idle and shutdown timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Seconds a read may wait for data before it reports EOF
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<f64>,

    /// Seconds to wait for active connections to finish on close
    #[serde(default = "default_close_timeout")]
    pub close_timeout: f64,

    /// Seconds to wait for the SSH connection to close
    #[serde(default = "default_ssh_close_timeout")]
    pub ssh_close_timeout: f64,
}

impl TimingConfig {
    pub fn with_idle_timeout(mut self, secs: f64) -> Self {
        self.idle_timeout = Some(secs);
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout.map(seconds)
    }

    pub fn close_timeout(&self) -> Duration {
        seconds(self.close_timeout)
    }

    pub fn ssh_close_timeout(&self) -> Duration {
        seconds(self.ssh_close_timeout)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_optional(
            self.idle_timeout.as_ref(),
            Requirement::Positive,
            "idle_timeout must be a positive number of seconds",
        )?;
        check_that(
            &self.close_timeout,
            Requirement::NonNegative,
            "close_timeout must be non-negative",
        )?;
        check_that(
            &self.ssh_close_timeout,
            Requirement::NonNegative,
            "ssh_close_timeout must be non-negative",
        )
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            close_timeout: default_close_timeout(),
            ssh_close_timeout: default_ssh_close_timeout(),
        }
    }
}

/// How the bounded duration history evicts samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionStrategy {
    /// Keep the most recently flushed samples
    #[default]
    Recent,
    /// Keep the largest samples ever seen
    Outliers,
}

/// Metrics aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Flush cadence in seconds
    #[serde(default = "default_metrics_interval")]
    pub interval: f64,

    #[serde(default = "default_max_durations")]
    pub max_durations: usize,

    #[serde(default)]
    pub retention_strategy: RetentionStrategy,
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        seconds(self.interval)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_that(
            &self.interval,
            Requirement::Positive,
            "metrics interval must be positive",
        )?;
        check_that(
            &self.max_durations,
            Requirement::Positive,
            "max_durations must be a positive integer",
        )
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: default_metrics_interval(),
            max_durations: default_max_durations(),
            retention_strategy: RetentionStrategy::Recent,
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

fn default_keepalive_interval() -> f64 {
    60.0
}

fn default_keepalive_count_max() -> usize {
    3
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_backoff() -> f64 {
    1.0
}

fn default_reconnect_backoff_factor() -> f64 {
    2.0
}

fn default_ssh_tun_timeout() -> f64 {
    30.0
}

fn default_close_timeout() -> f64 {
    1.0
}

fn default_ssh_close_timeout() -> f64 {
    5.0
}

fn default_metrics_interval() -> f64 {
    1.0
}

fn default_max_durations() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: ServerConfig = serde_json::from_str(r#"{"host": "localhost"}"#).unwrap();
        assert_eq!(config.port, 0);
        assert!(config.suppress_client_errors);
        assert!(!config.use_ssh());
        assert_eq!(config.timing.close_timeout, 1.0);
        assert_eq!(config.timing.ssh_close_timeout, 5.0);
        assert_eq!(config.metrics.max_durations, 1000);
        assert_eq!(config.metrics.retention_strategy, RetentionStrategy::Recent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ssh_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"host": "localhost", "port": 8000, "ssh": {"ssh_host": "bastion"}}"#,
        )
        .unwrap();
        assert!(config.use_ssh());
        let ssh = config.ssh.unwrap();
        assert_eq!(ssh.ssh_port, 22);
        assert_eq!(ssh.reconnect_attempts, 5);
        assert_eq!(ssh.reconnect_backoff_factor, 2.0);
        assert!(ssh.reconnect_on_disconnect);
        assert!(!ssh.check_key_permissions);
    }

    #[test]
    fn test_ssh_section_without_host_is_plain_mode() {
        let config = ServerConfig::new("localhost", 0).with_ssh(SshSettings::defaults());
        assert!(!config.use_ssh());
    }

    #[test]
    fn test_require_names_missing_keys() {
        let mut ssh = SshSettings::defaults();
        ssh.ssh_host = Some("bastion".into());
        ssh.ssh_user = Some("deploy".into());
        let err = ssh.require().unwrap_err();
        assert!(err.0.contains("ssh_key_path"));
        assert!(err.0.contains("remote_bind_host"));
        assert!(err.0.contains("remote_bind_port"));
        assert!(!err.0.contains("ssh_user"));
    }

    #[test]
    fn test_require_complete() {
        let ssh = SshSettings::new("bastion", "deploy", "/keys/id", "127.0.0.1", 9000);
        let target = ssh.require().unwrap();
        assert_eq!(target.host, "bastion");
        assert_eq!(target.port, 22);
        assert_eq!(target.remote_bind_port, 9000);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ServerConfig::new("", 0).validate().is_err());
        assert!(ServerConfig::new("localhost", 0)
            .with_max_connections(0)
            .validate()
            .is_err());
        let timing = TimingConfig::default().with_idle_timeout(0.0);
        assert!(ServerConfig::new("localhost", 0)
            .with_timing(timing)
            .validate()
            .is_err());
        let metrics = MetricsConfig {
            interval: 0.0,
            ..MetricsConfig::default()
        };
        assert!(ServerConfig::new("localhost", 0)
            .with_metrics(metrics)
            .validate()
            .is_err());
    }

    #[test]
    fn test_huge_values_saturate() {
        let mut ssh = SshSettings::new("bastion", "deploy", "/keys/id", "127.0.0.1", 9000);
        ssh.ssh_tun_timeout = 1e300;
        ssh.reconnect_backoff = f64::MAX;
        ssh.reconnect_backoff_factor = 1e300;
        let config = ServerConfig::new("localhost", 0)
            .with_ssh(ssh.clone())
            .with_timing(TimingConfig::default().with_idle_timeout(1e300))
            .with_metrics(MetricsConfig {
                interval: 1e300,
                ..MetricsConfig::default()
            });
        assert!(config.validate().is_ok());

        assert_eq!(ssh.handshake_timeout(), MAX_DELAY);
        assert_eq!(ssh.initial_backoff(), MAX_DELAY);
        assert_eq!(config.timing.idle_timeout(), Some(MAX_DELAY));
        assert_eq!(config.metrics.interval(), MAX_DELAY);
        assert_eq!(seconds(f64::INFINITY), MAX_DELAY);
        assert_eq!(seconds(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn test_retention_strategy_serde() {
        let m: MetricsConfig = serde_json::from_str(r#"{"retention_strategy": "outliers"}"#).unwrap();
        assert_eq!(m.retention_strategy, RetentionStrategy::Outliers);
        assert_eq!(m.interval, 1.0);
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        let p = std::path::Path::new("/etc/ssh/key");
        assert_eq!(expand_tilde(p), PathBuf::from("/etc/ssh/key"));
    }
}
