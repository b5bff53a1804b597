//! Connection transports
//!
//! Handlers see a connection as a [`ReadTransport`] and a [`WriteTransport`].
//! [`StreamReader`] / [`StreamWriter`] implement them over any tokio
//! `AsyncRead` / `AsyncWrite`; [`GatedReader`] / [`GatedWriter`] wrap those
//! to check the tunnel before every call and to apply the idle timeout.

mod gated;
mod transport;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::StreamError;

pub use gated::{Gate, GatedReader, GatedWriter};
pub use transport::{StreamReader, StreamWriter};

/// Reader handed to connection handlers
pub type WrappedReader = GatedReader<StreamReader<OwnedReadHalf>>;

/// Writer handed to connection handlers
pub type WrappedWriter = GatedWriter<StreamWriter<OwnedWriteHalf>>;

/// Read side of a connection.
///
/// Reads return an empty buffer at end of stream.
#[async_trait]
pub trait ReadTransport: Send {
    /// Read up to `max` bytes.
    async fn read(&mut self, max: usize) -> Result<Vec<u8>, StreamError>;

    /// Read through the next `\n`, inclusive. A partial line is returned at EOF.
    async fn read_line(&mut self) -> Result<Vec<u8>, StreamError>;

    /// Read through the next `delim`, inclusive. A partial chunk is returned at EOF.
    async fn read_until(&mut self, delim: u8) -> Result<Vec<u8>, StreamError>;

    /// Read exactly `n` bytes; EOF first is an `UnexpectedEof` error.
    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError>;

    fn at_eof(&self) -> bool;
}

/// Write side of a connection.
#[async_trait]
pub trait WriteTransport: Send {
    /// Queue bytes; they reach the peer on `drain` at the latest.
    async fn write(&mut self, data: &[u8]) -> Result<(), StreamError>;

    /// Flush everything queued so far.
    async fn drain(&mut self) -> Result<(), StreamError>;

    /// Flush and shut the connection down.
    async fn close(&mut self) -> Result<(), StreamError>;

    fn is_closing(&self) -> bool;

    fn peer_addr(&self) -> Result<SocketAddr, StreamError>;

    fn local_addr(&self) -> Result<SocketAddr, StreamError>;

    fn can_write_eof(&self) -> bool;

    /// Flush and half-close: the peer reads EOF, reading here still works.
    async fn write_eof(&mut self) -> Result<(), StreamError>;
}
