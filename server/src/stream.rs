//! Byte-stream capability shared by session pipes and OS handles.
//!
//! Process stdio and the session's [`StreamPipe`]s are bridged by the same
//! copy loop, [`pump`]. Anything that can be read in chunks implements
//! [`ByteSource`]; anything that can be written and closed implements
//! [`ByteSink`]. Pipes implement both directly; tokio `AsyncRead`/`AsyncWrite`
//! handles (child stdio, sockets) get them through [`IoStream`].

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StreamError;
use crate::sessions::pipe::StreamPipe;

/// Readable half of a byte stream.
pub trait ByteSource: Send {
    /// Read at most `max_len` bytes.
    ///
    /// An empty chunk means "nothing this time, ask again". End of stream is
    /// reported as [`StreamError::Closed`].
    fn read_chunk(
        &mut self,
        max_len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, StreamError>> + Send;
}

/// Writable half of a byte stream.
pub trait ByteSink: Send {
    fn write_chunk(&mut self, data: &[u8]) -> impl Future<Output = Result<(), StreamError>> + Send;

    /// Signal end of stream to the other side.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

impl ByteSource for Arc<StreamPipe> {
    async fn read_chunk(&mut self, max_len: usize) -> Result<Vec<u8>, StreamError> {
        Ok(self.read(max_len).await?)
    }
}

impl ByteSink for Arc<StreamPipe> {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StreamError> {
        Ok(self.write(data).await?)
    }

    async fn close(&mut self) {
        StreamPipe::close(self);
    }
}

/// Adapter giving tokio I/O handles the [`ByteSource`]/[`ByteSink`] shape.
pub struct IoStream<T>(pub T);

impl<T: AsyncRead + Unpin + Send> ByteSource for IoStream<T> {
    async fn read_chunk(&mut self, max_len: usize) -> Result<Vec<u8>, StreamError> {
        let mut buf = vec![0u8; max_len.max(1)];
        let n = self.0.read(&mut buf).await?;
        if n == 0 {
            return Err(StreamError::Closed);
        }
        buf.truncate(n);
        Ok(buf)
    }
}

impl<T: AsyncWrite + Unpin + Send> ByteSink for IoStream<T> {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.0.write_all(data).await?;
        self.0.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

/// Copy from `src` to `dst` in chunks of at most `chunk_size` until `src`
/// ends. Returns the number of bytes copied.
///
/// `dst` is left open; the caller decides whether the end of `src` should end
/// `dst` too.
pub async fn pump<S, D>(src: &mut S, dst: &mut D, chunk_size: usize) -> Result<u64, StreamError>
where
    S: ByteSource,
    D: ByteSink,
{
    let mut copied = 0u64;
    loop {
        match src.read_chunk(chunk_size).await {
            Ok(chunk) if chunk.is_empty() => {}
            Ok(chunk) => {
                dst.write_chunk(&chunk).await?;
                copied += chunk.len() as u64;
            }
            Err(StreamError::Closed) => return Ok(copied),
            Err(e) => return Err(e),
        }
    }
}
