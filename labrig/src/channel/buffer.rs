//! Accumulated channel output, searched for prompts incrementally.
//!
//! Output is accumulated as it arrives and only the region that could contain
//! a new match is searched after each read: the freshly appended bytes plus a
//! look-behind of `search_depth` bytes. For large outputs (boot logs, build
//! output) this keeps prompt detection linear in the output size.

use std::ops::Range;

use bytes::{Bytes, BytesMut};

use super::patterns::{Prompt, PromptMatcher};

/// Output read so far during one prompt wait.
#[derive(Debug)]
pub struct PatternBuffer {
    /// Bytes not yet split off by a match.
    buffer: BytesMut,

    /// How many bytes before the unsearched region are searched again.
    search_depth: usize,

    /// Length of the buffer at the last search.
    searched: usize,
}

impl PatternBuffer {
    /// Empty buffer that re-searches `search_depth` bytes behind new data.
    pub fn new(search_depth: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            search_depth,
            searched: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Search the unsearched tail of the buffer for the prompt.
    ///
    /// Returns the match range in absolute buffer offsets. Every byte is
    /// covered by some search, so the first match in the whole buffer is
    /// the one reported.
    pub fn search_tail(&mut self, prompt: &Prompt) -> Option<Range<usize>> {
        let look_behind = prompt
            .overlap()
            .map_or(self.search_depth, |o| o.max(self.search_depth));
        let start = self.searched.saturating_sub(look_behind);
        self.searched = self.buffer.len();

        prompt
            .find_match(&self.buffer[start..])
            .map(|m| m.start + start..m.end + start)
    }

    /// Search everything accumulated, ignoring what was searched before.
    pub fn search_full(&self, prompt: &Prompt) -> Option<Range<usize>> {
        prompt.find_match(&self.buffer)
    }

    /// Split the buffer around a match.
    ///
    /// Returns the bytes before the match and the bytes after it; the matched
    /// bytes themselves are dropped. The buffer is left empty.
    pub fn split_match(&mut self, m: Range<usize>) -> (Bytes, Bytes) {
        let mut rest = std::mem::take(&mut self.buffer);
        let after = rest.split_off(m.end);
        rest.truncate(m.start);
        self.searched = 0;
        (rest.freeze(), after.freeze())
    }

    /// Hand out everything accumulated and start over.
    pub fn take(&mut self) -> Bytes {
        self.searched = 0;
        std::mem::take(&mut self.buffer).freeze()
    }

    /// Accumulated bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
