//! SSH module - the russh client behind the reverse tunnel
//!
//! # Features
//! - Public key authentication
//! - Optional host key verification against a known_hosts file
//! - Remote port forwarding, with forwarded channels bridged to the local
//!   listener
//! - Single owner task for the russh `Handle` (see `handle_owner`)

mod client;
mod connector;
mod error;
mod handle_owner;

pub use client::{ClientHandler, ForwardTarget, SshClient};
pub use connector::RusshConnector;
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
