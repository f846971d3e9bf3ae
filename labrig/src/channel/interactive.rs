//! Handing a channel over to the user's terminal.

use std::fs::File;
use std::io::{IsTerminal, Read};
use std::os::fd::{AsFd, AsRawFd};

use log::{debug, info};
use memchr::memmem;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncWriteExt, Stdout};

use super::session::{Channel, EOT};
use crate::error::{ChannelError, Result};

/// Local stdin in raw, non-blocking mode; restored on drop.
struct TerminalGuard {
    stdin: AsyncFd<File>,
    flags: OFlag,
    termios: Option<Termios>,
}

impl TerminalGuard {
    fn acquire() -> std::result::Result<Self, ChannelError> {
        let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
        let file = File::from(fd);

        let termios = if file.is_terminal() {
            let saved = tcgetattr(&file)?;
            let mut raw = saved.clone();
            cfmakeraw(&mut raw);
            tcsetattr(&file, SetArg::TCSANOW, &raw)?;
            Some(saved)
        } else {
            None
        };

        let flags = OFlag::from_bits_truncate(fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

        Ok(Self {
            stdin: AsyncFd::new(file)?,
            flags,
            termios,
        })
    }

    async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.stdin.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let file = self.stdin.get_ref();
        let _ = fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(self.flags));
        if let Some(termios) = &self.termios {
            let _ = tcsetattr(file, SetArg::TCSANOW, termios);
        }
    }
}

/// Where the end-magic sequence completes within the latest input.
///
/// `window` holds the tail of earlier input followed by `chunk`. Returns how
/// many bytes of `chunk` precede the match.
fn find_end_magic(window: &[u8], chunk_len: usize, end_magic: &[u8]) -> Option<usize> {
    let tail = window.len() - chunk_len;
    memmem::find(window, end_magic).map(|pos| pos.saturating_sub(tail))
}

impl Channel {
    /// Connect the local terminal to the channel until the user presses
    /// Ctrl-D.
    pub async fn attach_interactive(&mut self) -> Result<()> {
        self.attach_interactive_until(&[EOT]).await
    }

    /// Connect the local terminal to the channel until `end_magic` is typed.
    ///
    /// The end-magic sequence itself is not forwarded. Returns
    /// [`ChannelError::Closed`] if the remote side goes away first.
    pub async fn attach_interactive_until(&mut self, end_magic: &[u8]) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        info!("attaching to '{}'", self.name());

        let terminal = TerminalGuard::acquire()?;

        if !self.pending.is_empty() {
            let pending = self.take_pending(usize::MAX);
            stdout.write_all(&pending).await?;
            stdout.flush().await?;
        }

        let result = self.interact(&terminal, &mut stdout, end_magic).await;
        drop(terminal);
        debug!("detached from '{}'", self.name());
        result
    }

    async fn interact(
        &mut self,
        terminal: &TerminalGuard,
        stdout: &mut Stdout,
        end_magic: &[u8],
    ) -> Result<()> {
        let keep = end_magic.len().saturating_sub(1);
        let mut window: Vec<u8> = Vec::with_capacity(keep + 1024);
        let mut input = vec![0u8; 1024];
        let read_chunk = self.config.read_chunk;

        loop {
            tokio::select! {
                typed = terminal.read(&mut input) => {
                    let n = typed?;
                    if n == 0 {
                        debug!("local input closed");
                        return Ok(());
                    }
                    let chunk = &input[..n];

                    let start = window.len().saturating_sub(keep);
                    window.drain(..start);
                    window.extend_from_slice(chunk);

                    if !end_magic.is_empty() {
                        if let Some(before) = find_end_magic(&window, n, end_magic) {
                            self.write_all(&chunk[..before]).await?;
                            return Ok(());
                        }
                    }
                    self.write_all(chunk).await?;
                }
                output = self.io.read(read_chunk, None) => {
                    let data = output?;
                    self.mirror(&data, true);
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_magic_in_single_chunk() {
        assert_eq!(find_end_magic(b"ls\x04", 3, &[EOT]), Some(2));
        assert_eq!(find_end_magic(b"ls", 2, &[EOT]), None);
    }

    #[test]
    fn test_end_magic_across_chunks() {
        // "~" arrived earlier, "." completes the sequence
        assert_eq!(find_end_magic(b"~.", 1, b"~."), Some(0));
        assert_eq!(find_end_magic(b"x~.rest", 5, b"~."), Some(0));
        assert_eq!(find_end_magic(b"abc~.", 5, b"~."), Some(3));
    }
}
