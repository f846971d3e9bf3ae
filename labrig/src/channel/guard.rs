//! Scoped overrides of a channel's prompt and output sinks.
//!
//! Each override returns a guard that dereferences to the channel and puts
//! the previous state back when dropped, so nested overrides unwind in LIFO
//! order even on early returns.

use std::ops::{Deref, DerefMut};

use super::patterns::Prompt;
use super::session::Channel;
use super::sink::{OutputSink, SinkSlot};

impl Channel {
    /// Use `prompt` until the returned guard is dropped.
    pub fn with_prompt(&mut self, prompt: impl Into<Prompt>) -> PromptGuard<'_> {
        let previous = self.prompt.replace(prompt.into());
        PromptGuard {
            channel: self,
            previous,
        }
    }

    /// Mirror everything read into `sink` until the returned guard is dropped.
    ///
    /// With `show_prompt` false, the sink gets the bytes around each matched
    /// prompt but never the prompt itself.
    pub fn with_stream(
        &mut self,
        sink: impl OutputSink + 'static,
        show_prompt: bool,
    ) -> StreamGuard<'_> {
        let depth = self.streams.len();
        self.streams.push(SinkSlot::new(Box::new(sink), show_prompt));
        StreamGuard {
            channel: self,
            depth,
        }
    }

    /// Detach all sinks until the returned guard is dropped.
    pub fn with_streams_muted(&mut self) -> MuteGuard<'_> {
        let saved = std::mem::take(&mut self.streams);
        MuteGuard {
            channel: self,
            saved,
        }
    }
}

/// Restores the previous prompt on drop.
pub struct PromptGuard<'a> {
    channel: &'a mut Channel,
    previous: Option<Prompt>,
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        self.channel.prompt = self.previous.take();
    }
}

/// Detaches its sink (and anything attached after it) on drop.
pub struct StreamGuard<'a> {
    channel: &'a mut Channel,
    depth: usize,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.channel.streams.truncate(self.depth);
    }
}

/// Reattaches the muted sinks on drop.
pub struct MuteGuard<'a> {
    channel: &'a mut Channel,
    saved: Vec<SinkSlot>,
}

impl Drop for MuteGuard<'_> {
    fn drop(&mut self) {
        // Whatever was read while muted counts as seen
        let pending = self.channel.pending.len();
        for slot in &mut self.saved {
            slot.seen = pending;
        }
        self.channel.streams = std::mem::take(&mut self.saved);
    }
}

macro_rules! deref_channel {
    ($($guard:ident),*) => {
        $(
            impl Deref for $guard<'_> {
                type Target = Channel;

                fn deref(&self) -> &Channel {
                    self.channel
                }
            }

            impl DerefMut for $guard<'_> {
                fn deref_mut(&mut self) -> &mut Channel {
                    self.channel
                }
            }
        )*
    };
}

deref_channel!(PromptGuard, StreamGuard, MuteGuard);
