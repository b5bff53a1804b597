//! Buffered transports over tokio I/O halves

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::{ReadTransport, WriteTransport};
use crate::error::StreamError;

/// Buffered reader half.
///
/// Reads are cancel-safe: when a read is cut short (idle timeout, server
/// shutdown) the bytes it already took off the socket stay in `pending`
/// and are returned by the next read.
pub struct StreamReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::new(),
            eof: false,
        }
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut()
    }

    /// Unwrap the reader. Buffered but unread bytes are lost.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }

    fn take_pending(&mut self, n: usize) -> Vec<u8> {
        let rest = self.pending.split_off(n.min(self.pending.len()));
        std::mem::replace(&mut self.pending, rest)
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ReadTransport for StreamReader<R> {
    async fn read(&mut self, max: usize) -> Result<Vec<u8>, StreamError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        if !self.pending.is_empty() {
            return Ok(self.take_pending(max));
        }
        let mut buf = vec![0u8; max];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            self.eof = true;
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, StreamError> {
        self.read_until(b'\n').await
    }

    async fn read_until(&mut self, delim: u8) -> Result<Vec<u8>, StreamError> {
        if let Some(pos) = self.pending.iter().position(|b| *b == delim) {
            return Ok(self.take_pending(pos + 1));
        }
        // Appends to `pending`, so a partial line survives cancellation
        self.inner.read_until(delim, &mut self.pending).await?;
        let out = std::mem::take(&mut self.pending);
        if out.last() != Some(&delim) {
            self.eof = true;
        }
        Ok(out)
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        while self.pending.len() < n {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                // A short read consumes what arrived
                self.eof = true;
                self.pending.clear();
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            let take = available.len().min(n - self.pending.len());
            self.pending.extend_from_slice(&available[..take]);
            self.inner.consume(take);
        }
        Ok(self.take_pending(n))
    }

    fn at_eof(&self) -> bool {
        self.eof && self.pending.is_empty() && self.inner.buffer().is_empty()
    }
}

pub struct StreamWriter<W> {
    inner: BufWriter<W>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    closing: bool,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    /// A writer with no socket addresses, e.g. over an in-memory pipe.
    pub fn new(inner: W) -> Self {
        Self::with_addrs(inner, None, None)
    }

    pub fn with_addrs(inner: W, peer: Option<SocketAddr>, local: Option<SocketAddr>) -> Self {
        Self {
            inner: BufWriter::new(inner),
            peer,
            local,
            closing: false,
        }
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut W {
        self.inner.get_mut()
    }

    /// Unwrap the writer. Bytes not yet drained are lost.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl StreamWriter<OwnedWriteHalf> {
    pub fn from_tcp(half: OwnedWriteHalf) -> Self {
        let peer = half.peer_addr().ok();
        let local = half.local_addr().ok();
        Self::with_addrs(half, peer, local)
    }
}

impl StreamReader<OwnedReadHalf> {
    pub fn from_tcp(half: OwnedReadHalf) -> Self {
        Self::new(half)
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> WriteTransport for StreamWriter<W> {
    async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.closing {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        self.inner.write_all(data).await?;
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), StreamError> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.closing {
            return Ok(());
        }
        self.closing = true;
        self.inner.shutdown().await?;
        Ok(())
    }

    fn is_closing(&self) -> bool {
        self.closing
    }

    fn peer_addr(&self) -> Result<SocketAddr, StreamError> {
        self.peer
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected).into())
    }

    fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        self.local
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected).into())
    }

    fn can_write_eof(&self) -> bool {
        true
    }

    async fn write_eof(&mut self) -> Result<(), StreamError> {
        // Shutting down a write half only half-closes the connection
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_line_reads() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = StreamWriter::new(client);
        let mut reader = StreamReader::new(server);

        writer.write(b"hello\nwor").await.unwrap();
        writer.drain().await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(reader.read_line().await.unwrap(), b"hello\n");
        assert!(!reader.at_eof());
        assert_eq!(reader.read_line().await.unwrap(), b"wor");
        assert!(reader.at_eof());
        assert!(reader.read(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_exact_short() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = StreamWriter::new(client);
        let mut reader = StreamReader::new(server);

        writer.write(b"abc").await.unwrap();
        writer.close().await.unwrap();

        match reader.read_exact(5).await {
            Err(StreamError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
        assert!(reader.at_eof());
    }

    #[tokio::test]
    async fn test_interrupted_line_read_keeps_partial_bytes() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = StreamWriter::new(client);
        let mut reader = StreamReader::new(server);

        writer.write(b"par").await.unwrap();
        writer.drain().await.unwrap();
        let cut = tokio::time::timeout(Duration::from_millis(50), reader.read_line()).await;
        assert!(cut.is_err());

        writer.write(b"tial\nnext\n").await.unwrap();
        writer.drain().await.unwrap();
        assert_eq!(reader.read_line().await.unwrap(), b"partial\n");
        assert_eq!(reader.read_line().await.unwrap(), b"next\n");
    }

    #[tokio::test]
    async fn test_interrupted_read_exact_keeps_partial_bytes() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = StreamWriter::new(client);
        let mut reader = StreamReader::new(server);

        writer.write(b"a\nb").await.unwrap();
        writer.drain().await.unwrap();
        let cut = tokio::time::timeout(Duration::from_millis(50), reader.read_exact(4)).await;
        assert!(cut.is_err());

        // Whatever was taken so far is served first, line boundaries included
        assert_eq!(reader.read_line().await.unwrap(), b"a\n");
        assert_eq!(reader.read(8).await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (client, _server) = tokio::io::duplex(64);
        let mut writer = StreamWriter::new(client);
        writer.close().await.unwrap();
        assert!(writer.is_closing());
        assert!(writer.write(b"late").await.is_err());
        assert!(writer.peer_addr().is_err());
    }
}
