//! Output sinks that channel traffic can be tee'd into.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use log::info;
use tokio::sync::mpsc::UnboundedSender;

/// Anything that can receive a copy of the bytes read from a channel.
pub trait OutputSink: Send {
    /// Append newly read bytes.
    fn append(&mut self, data: &[u8]);
}

/// Attached sink plus whether it wants to see matched prompts.
pub(crate) struct SinkSlot {
    pub(crate) sink: Box<dyn OutputSink>,
    pub(crate) show_prompt: bool,
    /// How many leading bytes of the channel's pending buffer this sink
    /// already received.
    pub(crate) seen: usize,
}

impl SinkSlot {
    pub(crate) fn new(sink: Box<dyn OutputSink>, show_prompt: bool) -> Self {
        Self {
            sink,
            show_prompt,
            seen: 0,
        }
    }

    /// Hand over `data[self.seen..upto]` if the sink has not had it yet.
    pub(crate) fn catch_up(&mut self, data: &[u8], upto: usize) {
        if self.seen < upto {
            self.sink.append(&data[self.seen..upto]);
            self.seen = upto;
        }
    }
}

/// A cloneable in-memory sink; all clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far.
    pub fn contents(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Contents as text (lossy UTF-8).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Discard the contents.
    pub fn clear(&self) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl OutputSink for SharedBuffer {
    fn append(&mut self, data: &[u8]) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }
}

/// Emits complete output lines through the `log` facade.
///
/// Partial lines are held until their newline arrives, or until the sink is
/// dropped.
#[derive(Debug)]
pub struct LogSink {
    label: String,
    line: Vec<u8>,
}

impl LogSink {
    /// Create a sink whose lines are prefixed with `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            line: Vec::new(),
        }
    }

    fn emit(&mut self) {
        let text = String::from_utf8_lossy(&self.line);
        let text = text.trim_end_matches(['\r', '\n']);
        info!(target: "labrig::output", "[{}] {}", self.label, text);
        self.line.clear();
    }
}

impl OutputSink for LogSink {
    fn append(&mut self, data: &[u8]) {
        for &byte in data {
            self.line.push(byte);
            if byte == b'\n' {
                self.emit();
            }
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        if !self.line.is_empty() {
            self.emit();
        }
    }
}

/// Forward chunks to an async consumer. Sends after the receiver is gone are dropped.
impl OutputSink for UnboundedSender<Bytes> {
    fn append(&mut self, data: &[u8]) {
        let _ = self.send(Bytes::copy_from_slice(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_buffer_clones_share_contents() {
        let buffer = SharedBuffer::new();
        let mut writer = buffer.clone();
        writer.append(b"hello ");
        writer.append(b"world");
        assert_eq!(buffer.text(), "hello world");

        buffer.clear();
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_log_sink_buffers_partial_lines() {
        let mut sink = LogSink::new("lab");
        sink.append(b"first\r\nsec");
        assert_eq!(sink.line, b"sec");
        sink.append(b"ond\n");
        assert!(sink.line.is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_sender_sink() {
        let (mut tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        tx.append(b"chunk");
        assert_eq!(&rx.recv().await.unwrap()[..], b"chunk");
    }
}
