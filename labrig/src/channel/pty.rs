//! Child processes running on a pseudo-terminal.
//!
//! The child is started as the leader of a new session with the PTY slave as
//! its controlling terminal. Closing the channel kills the whole session, not
//! only the immediate child, and then waits for the session to drain.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::libc;
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, getsid, setsid};
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use super::config::{ChannelConfig, PtyConfig};
use super::io::{ChannelIo, trace_bytes};
use super::reap;
use super::session::Channel;
use crate::error::ChannelError;

nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, Winsize);

/// A process spawned on a fresh pseudo-terminal.
pub struct PtyChannelIo {
    /// Non-blocking PTY master (None once closed).
    master: Option<AsyncFd<File>>,

    /// The spawned session leader.
    child: Child,

    /// Pid of the session leader.
    pid: Pid,

    /// Exit status, once observed.
    status: Option<ExitStatus>,

    /// Command line, for diagnostics.
    command: String,
}

impl PtyChannelIo {
    /// Spawn a child on a new PTY according to `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &PtyConfig) -> Result<Self, ChannelError> {
        let winsize = Winsize {
            ws_row: config.terminal_height,
            ws_col: config.terminal_width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } = openpty(Some(&winsize), None)?;
        // Only the stdio copies of the slave may reach the child
        for fd in [&master, &slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }

        let flags = OFlag::from_bits_truncate(fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(
            master.as_raw_fd(),
            FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
        )?;

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        // SAFETY: only async-signal-safe calls (setsid, ioctl) run between
        // fork and exec.
        unsafe {
            command.pre_exec(|| {
                setsid()?;
                // stdin is the slave by now; make it the controlling terminal
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| ChannelError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
            .ok_or(ChannelError::Closed)?;

        // Drops the parent's copies of the slave along with `command`
        drop(command);

        let master = AsyncFd::new(File::from(master))?;
        debug!("spawned '{}' as session {}", config.command_line(), pid);

        Ok(Self {
            master: Some(master),
            child,
            pid,
            status: None,
            command: config.command_line(),
        })
    }

    /// Pid of the session leader.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Exit status of the session leader, if it has exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.closed();
        self.status
    }

    fn master(&self) -> Result<&AsyncFd<File>, ChannelError> {
        self.master.as_ref().ok_or(ChannelError::Closed)
    }
}

/// Normalize errors from an endpoint whose process may be gone.
fn map_io_error(err: io::Error) -> ChannelError {
    if err.raw_os_error() == Some(libc::EIO) {
        ChannelError::Closed
    } else {
        ChannelError::Io(err)
    }
}

#[async_trait]
impl ChannelIo for PtyChannelIo {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        if self.closed() {
            return Err(ChannelError::Closed);
        }

        trace_bytes(">", buf);
        let master = self.master()?;
        loop {
            let mut guard = master.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(buf)
            }) {
                Ok(Ok(0)) => return Err(ChannelError::Closed),
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) => return Err(map_io_error(e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn read(
        &mut self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Bytes, ChannelError> {
        let exited = self.closed();
        let master = self.master()?;
        let mut buf = vec![0u8; max];

        if exited {
            // Final read of whatever the process left behind
            let mut file = master.get_ref();
            return match file.read(&mut buf) {
                Ok(n) if n > 0 => {
                    buf.truncate(n);
                    trace_bytes("<", &buf);
                    Ok(Bytes::from(buf))
                }
                _ => Err(ChannelError::Closed),
            };
        }

        let deadline = timeout.map(|t| (Instant::now() + t, t));
        loop {
            let ready = master.readable();
            let mut guard = match deadline {
                Some((at, limit)) => tokio::time::timeout_at(at, ready)
                    .await
                    .map_err(|_| ChannelError::Timeout(limit))??,
                None => ready.await?,
            };

            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(Ok(0)) => return Err(ChannelError::Closed),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    trace_bytes("<", &buf);
                    return Ok(Bytes::from(buf));
                }
                Ok(Err(e)) => return Err(map_io_error(e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed() {
            return Err(ChannelError::Closed);
        }

        let sid = getsid(Some(self.pid)).unwrap_or(self.pid);
        debug!("closing '{}' (session {})", self.command, sid);

        // The leader created the session, so its process group id is the sid
        match killpg(sid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("failed to kill session {}: {}", sid, e),
        }
        self.master.take();
        self.status = Some(self.child.wait().await?);

        reap::wait_for_session_exit(sid).await
    }

    fn closed(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("cannot poll '{}': {}", self.command, e);
                true
            }
        }
    }

    fn fileno(&self) -> Option<RawFd> {
        self.master.as_ref().map(|m| m.as_raw_fd())
    }

    fn update_window_size(&mut self, columns: u16, lines: u16) -> Result<(), ChannelError> {
        let fd = self.fileno().ok_or(ChannelError::Closed)?;
        let winsize = Winsize {
            ws_row: lines,
            ws_col: columns,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: fd is our open PTY master and winsize outlives the call
        unsafe { set_window_size(fd, &winsize) }?;
        Ok(())
    }
}

impl Drop for PtyChannelIo {
    fn drop(&mut self) {
        if !self.closed() {
            warn!(
                "'{}' dropped without close(), killing session {}",
                self.command, self.pid
            );
            let _ = killpg(self.pid, Signal::SIGKILL);
        }
    }
}

/// Builder for channels backed by a PTY child.
///
/// # Example
///
/// ```rust,no_run
/// use labrig::channel::PtyBuilder;
///
/// # async fn example() -> Result<(), labrig::Error> {
/// let mut ch = PtyBuilder::new("picocom")
///     .args(["-b", "115200", "/dev/ttyUSB0"])
///     .spawn()?;
/// ch.send_line("", false).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PtyBuilder {
    pty: PtyConfig,
    channel: ChannelConfig,
}

impl PtyBuilder {
    /// Create a builder for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            pty: PtyConfig::new(program),
            channel: ChannelConfig::default(),
        }
    }

    /// Start from an existing spawn configuration.
    pub fn from_config(pty: PtyConfig) -> Self {
        Self {
            pty,
            channel: ChannelConfig::default(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.pty.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pty.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pty.env.insert(key.into(), value.into());
        self
    }

    /// Set the child's working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.pty.cwd = Some(cwd.into());
        self
    }

    /// Set terminal dimensions.
    pub fn terminal_size(mut self, width: u16, height: u16) -> Self {
        self.pty.terminal_width = width;
        self.pty.terminal_height = height;
        self
    }

    /// Set the default prompt-read deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.channel.timeout = Some(timeout);
        self
    }

    /// Replace the channel configuration.
    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    /// Spawn the child and wrap it in a [`Channel`].
    pub fn spawn(self) -> Result<Channel, ChannelError> {
        let io = PtyChannelIo::spawn(&self.pty)?;
        Ok(Channel::with_config(
            self.pty.command_line(),
            Box::new(io),
            self.channel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eio_means_closed() {
        let err = map_io_error(io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(err, ChannelError::Closed));

        let err = map_io_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, ChannelError::Io(_)));
    }

    #[test]
    fn test_builder_collects_spawn_config() {
        let builder = PtyBuilder::new("gdb")
            .arg("-nh")
            .args(["-nx", "/usr/bin/echo"])
            .env("TERM", "dumb")
            .terminal_size(80, 25)
            .timeout(Duration::from_secs(5));

        assert_eq!(builder.pty.command_line(), "gdb -nh -nx /usr/bin/echo");
        assert_eq!(builder.pty.env.get("TERM").map(String::as_str), Some("dumb"));
        assert_eq!(builder.pty.terminal_width, 80);
        assert_eq!(builder.channel.timeout, Some(Duration::from_secs(5)));
    }
}
