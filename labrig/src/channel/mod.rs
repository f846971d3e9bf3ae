//! Channel layer: process endpoints and prompt-synchronized I/O.
//!
//! A [`ChannelIo`] moves raw bytes to and from one endpoint (a child on a
//! pseudo-terminal, an open stream). A [`Channel`] sits on top and turns that
//! into a command/response conversation by reading until a [`Prompt`].

mod buffer;
mod config;
mod guard;
mod interactive;
mod io;
mod patterns;
mod pty;
pub mod reap;
mod session;
mod sink;
mod stream;

pub use buffer::PatternBuffer;
pub use config::{ChannelConfig, PtyConfig, READ_CHUNK_SIZE};
pub use guard::{MuteGuard, PromptGuard, StreamGuard};
pub use io::ChannelIo;
pub use patterns::{Prompt, PromptMatcher, compile_prompt_pattern};
pub use pty::{PtyBuilder, PtyChannelIo};
pub use session::Channel;
pub use sink::{LogSink, OutputSink, SharedBuffer};
pub use stream::StreamChannelIo;
