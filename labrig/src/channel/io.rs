//! Raw byte transport underneath a [`Channel`](super::Channel).

use std::os::fd::RawFd;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;

use crate::error::ChannelError;

/// One OS-level communication endpoint.
///
/// Implementations own the endpoint and, where there is one, the process
/// behind it. Reads and writes are unbuffered; line handling and prompt
/// synchronization live in [`Channel`](super::Channel).
#[async_trait]
pub trait ChannelIo: Send {
    /// Write `buf` to the endpoint and return the number of bytes taken.
    ///
    /// Fails with [`ChannelError::Closed`] if the endpoint is closed, including
    /// when the transport accepts zero bytes.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError>;

    /// Read at most `max` bytes.
    ///
    /// Waits up to `timeout` (forever if `None`) for data while the endpoint
    /// is alive. Once the backing process has exited, only a final
    /// non-waiting read is attempted.
    async fn read(&mut self, max: usize, timeout: Option<Duration>)
    -> Result<Bytes, ChannelError>;

    /// Terminate the endpoint and everything it spawned.
    async fn close(&mut self) -> Result<(), ChannelError>;

    /// Whether the backing process or stream is gone. Never blocks.
    fn closed(&mut self) -> bool;

    /// Underlying file descriptor, if there is one.
    fn fileno(&self) -> Option<RawFd>;

    /// Propagate a terminal size change to the endpoint.
    fn update_window_size(&mut self, columns: u16, lines: u16) -> Result<(), ChannelError>;
}

/// Trace channel traffic the way it crosses the endpoint.
pub(crate) fn trace_bytes(direction: &str, data: &[u8]) {
    trace!(target: "labrig::channel", "{} {:?}", direction, String::from_utf8_lossy(data));
}
