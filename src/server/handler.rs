//! Connection handler seam

use std::future::Future;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::stream::{WrappedReader, WrappedWriter};

/// Serves one accepted connection.
///
/// Implemented for every `Fn(WrappedReader, WrappedWriter) -> impl Future`,
/// so a plain async closure works:
///
/// ```ignore
/// server.start(|mut reader: WrappedReader, mut writer: WrappedWriter| async move {
///     let line = reader.read_line().await?;
///     writer.write(&line).await?;
///     writer.drain().await?;
///     Ok(())
/// })
/// ```
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, reader: WrappedReader, writer: WrappedWriter) -> Result<(), ClientError>;
}

#[async_trait]
impl<F, Fut> ConnectionHandler for F
where
    F: Fn(WrappedReader, WrappedWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
{
    async fn handle(&self, reader: WrappedReader, writer: WrappedWriter) -> Result<(), ClientError> {
        (self)(reader, writer).await
    }
}
