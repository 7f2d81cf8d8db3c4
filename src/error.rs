//! Error types for the tabinit supervisor.

use std::path::PathBuf;
use thiserror::Error;

use crate::control::DecodeError;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the supervisor.
#[derive(Error, Debug)]
pub enum Error {
    /// Not running as PID 1
    #[error("Not running as PID 1 (current PID: {0})")]
    NotPid1(u32),

    /// No definition or runtime entry with this identifier
    #[error("Unknown process identifier: {0}")]
    UnknownProcess(String),

    /// A start was requested while the previous instance is still live
    #[error("Process {0} is already live")]
    AlreadyLive(String),

    /// Process spawn error
    #[error("Failed to spawn {id}: {reason}")]
    SpawnFailed { id: String, reason: String },

    /// Runlevel label is not a valid label
    #[error("Invalid runlevel: {0:?}")]
    InvalidRunlevel(String),

    /// Control frame could not be decoded
    #[error("Malformed control frame: {0}")]
    Decode(#[from] DecodeError),

    /// Control channel setup or transport error
    #[error("Control channel error: {path}: {reason}")]
    ControlChannel { path: PathBuf, reason: String },

    /// The event dispatcher is gone
    #[error("Event channel closed")]
    EventChannelClosed,

    /// An external collaborator failed
    #[error("{0}")]
    Collaborator(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Service table could not be read
    #[error("Failed to read service table {path}: {source}")]
    TableRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}
