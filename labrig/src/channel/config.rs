//! Channel and PTY spawn configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of bytes requested from the endpoint per read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Configuration for channel behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Default deadline for prompt reads (`None` waits forever).
    pub timeout: Option<Duration>,

    /// How many bytes behind the newest data are searched for a prompt.
    pub search_depth: usize,

    /// Bytes requested from the endpoint per read.
    pub read_chunk: usize,

    /// Terminator appended by `send_line`.
    pub line_ending: String,

    /// How long `terminate0` waits for the endpoint to close.
    pub terminate_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            search_depth: 1000,
            read_chunk: READ_CHUNK_SIZE,
            line_ending: "\n".to_string(),
            terminate_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for spawning a child process on a pseudo-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyConfig {
    /// Program to execute.
    pub program: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Working directory (inherits the caller's if unset).
    pub cwd: Option<PathBuf>,

    /// Terminal width.
    pub terminal_width: u16,

    /// Terminal height.
    pub terminal_height: u16,
}

impl PtyConfig {
    /// Create a spawn configuration for `program` with default terminal size.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            terminal_width: 511,
            terminal_height: 24,
        }
    }

    /// Human-readable command line, for diagnostics.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        let mut config = Self::new("bash");
        config.args = vec!["--norc".into(), "--noprofile".into(), "-i".into()];
        config
    }
}
