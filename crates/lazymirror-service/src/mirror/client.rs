use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// The response body of the client a document is streamed to.
///
/// Only forward writes of whole chunks are needed, which every [`AsyncWrite`] supports. Hosts
/// that stream through something else, like a channel feeding an HTTP body, implement this
/// directly. An error from [`write_buf`](Self::write_buf) means the client is gone.
pub trait WriteStream: Send {
    /// Writes the entire buffer.
    fn write_buf(&mut self, buf: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}

impl<T> WriteStream for T
where
    T: AsyncWrite + Unpin + Send,
{
    async fn write_buf(&mut self, buf: Bytes) -> io::Result<()> {
        self.write_all(&buf).await
    }
}
