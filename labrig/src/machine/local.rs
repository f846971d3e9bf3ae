//! A bash shell on the machine labrig itself runs on.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::{FromContext, Machine, Scoped};
use crate::channel::{Channel, ChannelConfig, LogSink, PtyBuilder, PtyConfig};
use crate::context::Context;
use crate::error::Result;
use crate::role::{BUILD_HOST, LAB_HOST, Role};

/// Prompt the shell is configured with.
///
/// The empty `\[\]` group keeps the echo of the assignment itself from
/// matching.
const PS1: &str = r"LABRIG\[\]-PROMPT$ ";

/// What the prompt looks like once bash has expanded it.
const PROMPT: &str = "LABRIG-PROMPT$ ";

/// How long shell setup may take.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Local `bash` running on a pseudo-terminal.
///
/// Default machine for [`LAB_HOST`] and [`BUILD_HOST`].
#[derive(Debug)]
pub struct LocalShell {
    channel: Channel,
    status: i32,
}

impl LocalShell {
    /// Spawn a shell and bring it to a known prompt.
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(PtyConfig::default(), ChannelConfig::default()).await
    }

    /// Spawn a shell from explicit configuration.
    pub async fn spawn_with(pty: PtyConfig, config: ChannelConfig) -> Result<Self> {
        let channel = PtyBuilder::from_config(pty)
            .env("TERM", "dumb")
            .channel_config(config)
            .spawn()?
            .initial_prompt(PROMPT);

        let mut shell = Self { channel, status: 0 };
        shell.init().await?;
        Ok(shell)
    }

    async fn init(&mut self) -> Result<()> {
        let mut ch = self.channel.with_streams_muted();
        ch.send_line(
            format!(
                "set +o emacs; set +o vi; unset HISTFILE; PROMPT_COMMAND=; PS2=; PS1='{}'",
                PS1
            ),
            false,
        )
        .await?;
        ch.read_until_prompt_with(None, Some(INIT_TIMEOUT)).await?;
        debug!("local shell ready");
        Ok(())
    }

    /// Run `command` and return its output.
    ///
    /// The command line is passed verbatim; quoting is up to the caller.
    pub async fn exec(&mut self, command: &str) -> Result<String> {
        let mut ch = self.channel.with_stream(LogSink::new("local"), false);
        ch.send_line(command, true).await?;
        ch.read_until_prompt().await
    }

    /// Run `command` and return its output and exit code.
    pub async fn exec_status(&mut self, command: &str) -> Result<(String, i32)> {
        let output = self.exec(command).await?;
        let code = self.exec("echo $?").await?;
        Ok((output, code.trim().parse().unwrap_or(-1)))
    }

    /// The shell's channel.
    pub fn channel(&mut self) -> &mut Channel {
        &mut self.channel
    }
}

#[async_trait]
impl Machine for LocalShell {
    fn name(&self) -> &str {
        "local"
    }

    fn exit_status(&self) -> i32 {
        self.status
    }

    fn set_exit_status(&mut self, status: i32) {
        self.status = status;
    }

    fn channel_mut(&mut self) -> Option<&mut Channel> {
        Some(&mut self.channel)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    /// Leave the shell with `exit` while the exit status is still `0`,
    /// otherwise kill it.
    ///
    /// A context teardown sets the status to `1` first, so only a direct
    /// `deinit()` call on a shell owned by the caller exits gracefully.
    async fn deinit(&mut self) -> Result<()> {
        if self.channel.is_closed() {
            return Ok(());
        }
        if self.status == 0 {
            self.channel.send_line("exit", false).await?;
            if self.channel.terminate0().await.is_ok() {
                return Ok(());
            }
        }
        self.channel.close().await
    }
}

#[async_trait]
impl FromContext for LocalShell {
    const NAME: &'static str = "LocalShell";

    fn roles() -> &'static [Role] {
        &[LAB_HOST, BUILD_HOST]
    }

    async fn from_context(_ctx: Context) -> Result<Scoped<Self>> {
        Ok(Scoped::new(Self::spawn().await?))
    }
}
