//! Channel I/O over an already-open byte stream.

use std::os::fd::RawFd;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::io::{ChannelIo, trace_bytes};
use crate::error::ChannelError;

/// Wraps any async byte stream (a serial device opened elsewhere, a socket
/// pair, an in-memory duplex) as channel I/O.
///
/// There is no process behind the stream: the endpoint counts as closed
/// once the peer signals EOF or [`close`](ChannelIo::close) was called.
pub struct StreamChannelIo<S> {
    stream: Option<S>,
    fd: Option<RawFd>,
}

impl<S> StreamChannelIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `stream`.
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            fd: None,
        }
    }

    /// Record the descriptor behind the stream so `fileno` can report it.
    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.fd = Some(fd);
        self
    }

    fn stream(&mut self) -> Result<&mut S, ChannelError> {
        self.stream.as_mut().ok_or(ChannelError::Closed)
    }
}

#[async_trait]
impl<S> ChannelIo for StreamChannelIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        trace_bytes(">", buf);
        let stream = self.stream()?;
        let n = stream.write(buf).await?;
        if n == 0 && !buf.is_empty() {
            self.stream = None;
            return Err(ChannelError::Closed);
        }
        stream.flush().await?;
        Ok(n)
    }

    async fn read(
        &mut self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Bytes, ChannelError> {
        let stream = self.stream()?;
        let mut buf = vec![0u8; max];

        let n = match timeout {
            Some(limit) => tokio::time::timeout(limit, stream.read(&mut buf))
                .await
                .map_err(|_| ChannelError::Timeout(limit))??,
            None => stream.read(&mut buf).await?,
        };

        if n == 0 {
            debug!("stream reached EOF");
            self.stream = None;
            return Err(ChannelError::Closed);
        }

        buf.truncate(n);
        trace_bytes("<", &buf);
        Ok(Bytes::from(buf))
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let mut stream = self.stream.take().ok_or(ChannelError::Closed)?;
        stream.shutdown().await?;
        Ok(())
    }

    fn closed(&mut self) -> bool {
        self.stream.is_none()
    }

    fn fileno(&self) -> Option<RawFd> {
        self.fd
    }

    fn update_window_size(&mut self, _columns: u16, _lines: u16) -> Result<(), ChannelError> {
        // Plain streams carry no terminal size
        Ok(())
    }
}
