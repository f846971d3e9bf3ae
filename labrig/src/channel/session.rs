//! Prompt-synchronized conversation over a [`ChannelIo`].

use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use super::buffer::PatternBuffer;
use super::config::ChannelConfig;
use super::io::ChannelIo;
use super::patterns::Prompt;
use super::sink::SinkSlot;
use super::stream::StreamChannelIo;
use crate::error::{ChannelError, Result};

/// End-of-transmission, what a terminal sends for Ctrl-D.
pub(super) const EOT: u8 = 0x04;

/// Interval at which `terminate0` re-checks the endpoint while draining.
const TERMINATE_POLL: Duration = Duration::from_millis(100);

/// Interval at which `terminate0` waits for the process once its output is
/// closed.
const EXIT_POLL: Duration = Duration::from_millis(10);

/// A bidirectional conversation with an interactive program.
///
/// Every "run a command, get its output" operation is a
/// [`send_line`](Self::send_line) followed by
/// [`read_until_prompt`](Self::read_until_prompt). Bytes read from the
/// endpoint are mirrored into every attached sink before they are consumed.
///
/// # Example
///
/// ```rust,no_run
/// use labrig::channel::{PtyBuilder, Prompt};
///
/// # async fn example() -> Result<(), labrig::Error> {
/// let mut ch = PtyBuilder::new("gdb").arg("-nx").spawn()?;
/// let mut gdb = ch.with_prompt(Prompt::literal("(gdb) "));
/// gdb.read_until_prompt().await?;
/// gdb.send_line("info threads", true).await?;
/// let out = gdb.read_until_prompt().await?;
/// println!("{}", out);
/// # Ok(())
/// # }
/// ```
pub struct Channel {
    /// Name used in diagnostics.
    name: String,

    /// The endpoint.
    pub(super) io: Box<dyn ChannelIo>,

    /// Configuration for this channel.
    pub(super) config: ChannelConfig,

    /// Active prompt.
    pub(super) prompt: Option<Prompt>,

    /// Attached sinks, in registration order.
    pub(super) streams: Vec<SinkSlot>,

    /// Bytes read from the endpoint but not consumed yet. Each sink slot
    /// records how much of it was already handed over.
    pub(super) pending: BytesMut,
}

impl Channel {
    /// Create a channel with default configuration.
    pub fn new(name: impl Into<String>, io: Box<dyn ChannelIo>) -> Self {
        Self::with_config(name, io, ChannelConfig::default())
    }

    /// Create a channel with the given configuration.
    pub fn with_config(
        name: impl Into<String>,
        io: Box<dyn ChannelIo>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            name: name.into(),
            io,
            config,
            prompt: None,
            streams: Vec::new(),
            pending: BytesMut::new(),
        }
    }

    /// Create a channel over an already-open async byte stream.
    pub fn from_stream<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(name, Box::new(StreamChannelIo::new(stream)))
    }

    /// Set the prompt the channel starts out with.
    pub fn initial_prompt(mut self, prompt: impl Into<Prompt>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Set the default prompt-read deadline (`None` waits forever).
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.config.timeout = timeout;
    }

    /// The active prompt.
    pub fn prompt(&self) -> Option<&Prompt> {
        self.prompt.as_ref()
    }

    /// Number of attached sinks.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Write raw bytes, returning how many the endpoint took.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.io.write(data).await?)
    }

    /// Write all of `data`.
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.io.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Read up to `max` bytes.
    ///
    /// Bytes left over from an earlier prompt match are returned first.
    pub async fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Bytes> {
        if !self.pending.is_empty() {
            return Ok(self.take_pending(max));
        }

        let chunk = self.io.read(max, timeout).await?;
        self.mirror(&chunk, true);
        Ok(chunk)
    }

    /// Send `text` followed by the line terminator.
    ///
    /// With `read_back`, the local echo of the line (as produced by a
    /// pseudo-terminal) is consumed and discarded afterwards, up to and
    /// including the echoed newline.
    pub async fn send_line(&mut self, text: impl AsRef<[u8]>, read_back: bool) -> Result<()> {
        let text = text.as_ref();
        let timeout = self.config.timeout;

        let mut line = Vec::with_capacity(text.len() + self.config.line_ending.len());
        line.extend_from_slice(text);
        line.extend_from_slice(self.config.line_ending.as_bytes());
        self.write_all(&line).await?;

        if read_back {
            if !text.is_empty() {
                self.read_until_match(&Prompt::literal(text), timeout).await?;
            }
            self.read_until_match(&Prompt::literal("\n"), timeout).await?;
        }
        Ok(())
    }

    /// Send a control character, e.g. `'C'` for an interrupt.
    pub async fn send_control(&mut self, key: char) -> Result<()> {
        let byte = control_byte(key)?;
        self.write_all(&[byte]).await
    }

    /// Read until the active prompt appears.
    ///
    /// Returns everything before the prompt. Uses the configured default
    /// deadline.
    pub async fn read_until_prompt(&mut self) -> Result<String> {
        self.read_until_prompt_with(None, None).await
    }

    /// Read until `prompt` (or the active prompt) appears, within `timeout`
    /// (or the configured default).
    ///
    /// Returns everything before the first match; bytes after the match are
    /// kept for the next read. Fails with [`ChannelError::Closed`] if the
    /// endpoint goes away first and with [`ChannelError::Timeout`] if the
    /// deadline passes first.
    pub async fn read_until_prompt_with(
        &mut self,
        prompt: Option<&Prompt>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let prompt = prompt
            .or(self.prompt.as_ref())
            .cloned()
            .ok_or(ChannelError::NoPrompt)?;
        let timeout = timeout.or(self.config.timeout);

        let before = self.read_until_match(&prompt, timeout).await?;
        Ok(String::from_utf8_lossy(&before).into_owned())
    }

    /// Drain output for `duration` and return what arrived.
    pub async fn read_until_timeout(&mut self, duration: Duration) -> Result<String> {
        let deadline = Instant::now() + duration;
        let mut collected = BytesMut::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read(self.config.read_chunk, Some(remaining)).await {
                Ok(chunk) => collected.extend_from_slice(&chunk),
                Err(e) if e.is_timeout() => break,
                Err(e) => {
                    // Already mirrored everywhere; keep it for the next read
                    self.pending.extend_from_slice(&collected);
                    self.mark_pending_seen();
                    return Err(e);
                }
            }
            if remaining.is_zero() {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Ask the program to exit and confirm that the endpoint closes.
    ///
    /// Sends EOF (Ctrl-D) and drains remaining output until the endpoint
    /// reports closure. Fails with [`ChannelError::NotTerminated`] if that
    /// does not happen within `terminate_timeout`.
    pub async fn terminate0(&mut self) -> Result<()> {
        let limit = self.config.terminate_timeout;
        let deadline = Instant::now() + limit;

        match self.io.write(&[EOT]).await {
            Ok(_) | Err(ChannelError::Closed) => {}
            Err(e) => return Err(e.into()),
        }
        self.pending.clear();
        for slot in &mut self.streams {
            slot.seen = 0;
        }

        loop {
            if self.io.closed() {
                debug!("'{}' terminated", self.name);
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::NotTerminated(limit).into());
            }

            match self
                .io
                .read(self.config.read_chunk, Some(remaining.min(TERMINATE_POLL)))
                .await
            {
                Ok(chunk) => self.mirror(&chunk, true),
                // The terminal is gone; the process itself may take a moment
                Err(ChannelError::Closed) => tokio::time::sleep(EXIT_POLL.min(remaining)).await,
                Err(ChannelError::Timeout(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close the endpoint, killing whatever runs behind it.
    pub async fn close(&mut self) -> Result<()> {
        debug!("closing channel '{}'", self.name);
        self.io.close().await?;
        Ok(())
    }

    /// Whether the endpoint is gone.
    pub fn is_closed(&mut self) -> bool {
        self.io.closed()
    }

    /// Underlying file descriptor, if any.
    pub fn fileno(&self) -> Option<RawFd> {
        self.io.fileno()
    }

    /// Propagate a terminal size change.
    pub fn update_window_size(&mut self, columns: u16, lines: u16) -> Result<()> {
        Ok(self.io.update_window_size(columns, lines)?)
    }

    /// Core synchronization: consume bytes up to the first match of `prompt`.
    ///
    /// Sinks that show prompts get every byte as soon as it is read. Sinks
    /// that hide prompts get the bytes before the match once it is known.
    /// Bytes left pending reach each sink when they are consumed, unless
    /// that sink already has them.
    pub(super) async fn read_until_match(
        &mut self,
        prompt: &Prompt,
        timeout: Option<Duration>,
    ) -> std::result::Result<Bytes, ChannelError> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let mut buffer = PatternBuffer::new(self.config.search_depth);
        buffer.extend(&self.pending.split());

        loop {
            if let Some(m) = buffer.search_tail(prompt) {
                let data = buffer.as_slice();
                for slot in &mut self.streams {
                    if slot.show_prompt {
                        slot.catch_up(data, m.end);
                    } else {
                        slot.catch_up(data, m.start);
                        slot.seen = slot.seen.max(m.end);
                    }
                    slot.seen -= m.end;
                }
                let (before, after) = buffer.split_match(m);
                self.pending.extend_from_slice(&after);
                return Ok(before);
            }

            let remaining = deadline.map(|(at, _)| at.saturating_duration_since(Instant::now()));
            match self.io.read(self.config.read_chunk, remaining).await {
                Ok(chunk) => {
                    buffer.extend(&chunk);
                    let data = buffer.as_slice();
                    for slot in self.streams.iter_mut().filter(|s| s.show_prompt) {
                        slot.catch_up(data, data.len());
                    }
                }
                Err(e) => {
                    // Hand everything to every sink; nothing read so far is lost
                    let data = buffer.as_slice();
                    for slot in &mut self.streams {
                        slot.catch_up(data, data.len());
                    }
                    self.pending.extend_from_slice(&buffer.take());
                    return Err(match (e, deadline) {
                        (ChannelError::Timeout(_), Some((_, limit))) => {
                            ChannelError::Timeout(limit)
                        }
                        (e, _) => e,
                    });
                }
            }
        }
    }

    /// Consume up to `max` pending bytes, catching up sinks that lack them.
    pub(super) fn take_pending(&mut self, max: usize) -> Bytes {
        let n = max.min(self.pending.len());
        let data = self.pending.split_to(n).freeze();
        for slot in &mut self.streams {
            slot.catch_up(&data, n);
            slot.seen -= n;
        }
        data
    }

    /// Record that every sink has all pending bytes.
    fn mark_pending_seen(&mut self) {
        let len = self.pending.len();
        for slot in &mut self.streams {
            slot.seen = len;
        }
    }

    /// Copy freshly read `data` into the attached sinks.
    pub(super) fn mirror(&mut self, data: &[u8], include_hidden: bool) {
        for slot in &mut self.streams {
            if include_hidden || slot.show_prompt {
                slot.sink.append(data);
            }
        }
    }
}

/// Map a key to its control character (`'C'` -> `0x03`).
pub(super) fn control_byte(key: char) -> std::result::Result<u8, ChannelError> {
    let upper = key.to_ascii_uppercase();
    if ('@'..='_').contains(&upper) {
        Ok(upper as u8 & 0x1f)
    } else {
        Err(ChannelError::InvalidControl(key))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("prompt", &self.prompt)
            .field("streams", &self.streams.len())
            .field("pending", &self.pending.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SharedBuffer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn channel() -> (Channel, DuplexStream) {
        let (local, remote) = tokio::io::duplex(4096);
        (Channel::from_stream("test", local), remote)
    }

    #[test]
    fn test_control_byte() {
        assert_eq!(control_byte('C').unwrap(), 0x03);
        assert_eq!(control_byte('c').unwrap(), 0x03);
        assert_eq!(control_byte('D').unwrap(), EOT);
        assert_eq!(control_byte('[').unwrap(), 0x1b);
        assert!(matches!(control_byte('1'), Err(ChannelError::InvalidControl('1'))));
    }

    #[tokio::test]
    async fn test_read_until_prompt_returns_bytes_before_prompt() {
        let (ch, mut remote) = channel();
        let mut ch = ch.initial_prompt("=> ");

        remote.write_all(b"U-Boot 2024.01\r\n=> ").await.unwrap();
        let out = ch.read_until_prompt().await.unwrap();
        assert_eq!(out, "U-Boot 2024.01\r\n");
    }

    #[tokio::test]
    async fn test_scripted_bootloader_exchange() {
        let console = tokio_test::io::Builder::new()
            .write(b"printenv bootcmd\n")
            .read(b"printenv bootcmd\r\nbootcmd=run distro_bootcmd\r\n=> ")
            .build();
        let mut ch = Channel::from_stream("uboot", console).initial_prompt("=> ");

        ch.send_line("printenv bootcmd", true).await.unwrap();
        let out = ch.read_until_prompt().await.unwrap();
        assert_eq!(out, "bootcmd=run distro_bootcmd\r\n");
    }

    #[tokio::test]
    async fn test_no_replay_after_match() {
        let (ch, mut remote) = channel();
        let mut ch = ch.initial_prompt("$ ");

        // Two prompts arrive in one chunk
        remote.write_all(b"one\n$ two\n$ three").await.unwrap();
        assert_eq!(ch.read_until_prompt().await.unwrap(), "one\n");
        assert_eq!(ch.read_until_prompt().await.unwrap(), "two\n");

        let rest = ch.read(64, Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(&rest[..], b"three");
    }

    #[tokio::test]
    async fn test_prompt_split_across_reads() {
        let (ch, mut remote) = channel();
        let mut ch = ch.initial_prompt("(gdb) ");

        let reader = tokio::spawn(async move { ch.read_until_prompt().await });
        remote.write_all(b"Breakpoint 1\n(gd").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.write_all(b"b) ").await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), "Breakpoint 1\n");
    }

    #[tokio::test]
    async fn test_no_prompt_configured() {
        let (mut ch, _remote) = channel();
        let err = ch.read_until_prompt().await.unwrap_err();
        assert!(matches!(err, crate::Error::Channel(ChannelError::NoPrompt)));
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_closed() {
        let (ch, mut remote) = channel();
        let mut ch = ch.initial_prompt("=> ");

        remote.write_all(b"partial").await.unwrap();
        let err = ch
            .read_until_prompt_with(None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_closed());

        // Partial output survives the timeout
        remote.write_all(b" line\n=> ").await.unwrap();
        assert_eq!(ch.read_until_prompt().await.unwrap(), "partial line\n");

        drop(remote);
        let err = ch.read_until_prompt().await.unwrap_err();
        assert!(err.is_closed());
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_regex_prompt_override() {
        let (ch, mut remote) = channel();
        let mut ch = ch.initial_prompt("$ ");

        remote.write_all(b"Password: ").await.unwrap();
        let pw = Prompt::regex(r"[Pp]assword: *").unwrap();
        let out = ch.read_until_prompt_with(Some(&pw), None).await.unwrap();
        assert_eq!(out, "");
        assert!(matches!(ch.prompt(), Some(Prompt::Literal(_))));
    }

    #[tokio::test]
    async fn test_send_line_with_read_back() {
        let (ch, mut remote) = channel();
        let mut ch = ch.initial_prompt("$ ");

        let echo = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let mut seen = Vec::new();
            while !seen.ends_with(b"\n") {
                let n = remote.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            // Echo like a terminal, then the command output and prompt
            remote.write_all(b"uname\r\nLinux\r\n$ ").await.unwrap();
            (seen, remote)
        });

        ch.send_line("uname", true).await.unwrap();
        let out = ch.read_until_prompt().await.unwrap();
        assert_eq!(out, "Linux\r\n");

        let (seen, _remote) = echo.await.unwrap();
        assert_eq!(seen, b"uname\n");
    }

    #[tokio::test]
    async fn test_send_control() {
        let (mut ch, mut remote) = channel();
        ch.send_control('C').await.unwrap();

        let mut buf = [0u8; 1];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x03);
    }

    #[tokio::test]
    async fn test_read_until_timeout_collects_output() {
        let (mut ch, mut remote) = channel();
        remote.write_all(b"boot noise").await.unwrap();

        let out = ch.read_until_timeout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(out, "boot noise");
    }

    #[tokio::test]
    async fn test_terminate0_confirms_closure() {
        let (mut ch, mut remote) = channel();
        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            remote.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], EOT);
            remote.write_all(b"bye\n").await.unwrap();
        });

        let log = SharedBuffer::new();
        let mut ch = ch.with_stream(log.clone(), true);
        ch.terminate0().await.unwrap();
        peer.await.unwrap();
        assert_eq!(log.text(), "bye\n");
    }

    #[tokio::test]
    async fn test_terminate0_reports_stuck_endpoint() {
        let config = ChannelConfig {
            terminate_timeout: Duration::from_millis(150),
            ..ChannelConfig::default()
        };
        let (local, _remote) = tokio::io::duplex(64);
        let mut ch = Channel::with_config("stuck", Box::new(StreamChannelIo::new(local)), config);

        let err = ch.terminate0().await.unwrap_err();
        assert!(matches!(err, crate::Error::Channel(ChannelError::NotTerminated(_))));
    }
}
