//! Error types for labrig.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for labrig operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Channel and channel I/O errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Machine lifecycle and registry errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// I/O error outside of a channel
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the channel's backing process or stream is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::Closed))
    }

    /// Whether this error is a bounded wait that ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::Timeout(_)))
    }
}

/// Channel layer errors (process endpoints, prompt synchronization).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The backing process or stream has terminated
    #[error("Channel closed")]
    Closed,

    /// No data arrived within the bounded wait
    #[error("No data within {0:?}")]
    Timeout(Duration),

    /// Processes of the child's session survived the close sequence
    #[error("Session {sid} still has processes after {attempts} reaping attempts")]
    ProcessTeardown { sid: i32, attempts: u32 },

    /// The endpoint did not close after a termination request
    #[error("Channel did not terminate within {0:?}")]
    NotTerminated(Duration),

    /// A prompt read was requested but no prompt is configured
    #[error("No prompt configured for this channel")]
    NoPrompt,

    /// Not a valid control key
    #[error("Invalid control key {0:?}")]
    InvalidControl(char),

    /// Invalid regex pattern
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Failed to spawn the child process
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Operating system call failed
    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    /// I/O error on the endpoint
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle errors: contract violations by the calling test code.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// `init` was called while an instance is alive
    #[error("Trying to re-initialize a live instance of '{class}'")]
    AlreadyInitialized { class: String },

    /// The instance is not alive
    #[error("Instance of '{class}' is not alive")]
    NotAlive { class: String },

    /// An exclusive lease is outstanding
    #[error("Instance of '{class}' is exclusively leased")]
    Unavailable { class: String },

    /// Exclusive access was requested while other leases are outstanding
    #[error("Cannot lease '{class}' exclusively: {users} lease(s) outstanding")]
    Busy { class: String, users: usize },

    /// A machine is already registered for this role
    #[error("A machine ('{existing}') is already registered for role '{role}'")]
    DuplicateRole { role: String, existing: String },

    /// The machine class does not provide the role it was registered for
    #[error("Machine '{class}' does not provide role '{role}'")]
    RoleNotProvided { class: String, role: String },

    /// No machine is registered for the requested target
    #[error("No machine found for '{target}'")]
    NoMachine { target: String },

    /// A machine was accessed as the wrong concrete type
    #[error("Machine type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },
}

/// Result type alias using labrig's Error.
pub type Result<T> = std::result::Result<T, Error>;
