//! Configuration
//!
//! Serde-backed server, SSH, timing and metrics settings plus the
//! precondition checks applied when a server is constructed.

pub mod check;
pub mod storage;
pub mod types;

pub use check::{check_optional, check_that, Checkable, Requirement};
pub use storage::LoadError;
pub use types::{
    expand_tilde, seconds, MetricsConfig, RetentionStrategy, ServerConfig, SshSettings, SshTarget,
    TimingConfig, MAX_DELAY,
};
