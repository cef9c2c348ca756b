//! Crate-wide error type
//!
//! Mirrors the failure taxonomy of the routing core. None of these conditions
//! is fatal to a running node: callers either reject the offending input at the
//! boundary or log it and keep going.

use crate::config::ConfigError;
use thiserror::Error;

/// Errors produced by the routing core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshError {
    /// Level or slot id outside `[0, levels) x [0, group_size)`
    #[error("Out of range: level {level}, id {id}")]
    OutOfRange { level: usize, id: usize },

    /// Slot belongs to the local node and cannot be released
    #[error("Slot {id} at level {level} is reserved for the local node")]
    ReservedSlot { level: usize, id: usize },

    /// Every slot of the level is occupied
    #[error("No free slot left at level {level}")]
    ResourceExhausted { level: usize },

    /// Malformed or inconsistent protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A wait on a peer reply expired or was cancelled
    #[error("Timed out waiting for reply")]
    Timeout,

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Link collaborator failure
    #[error("Link error: {0}")]
    Link(String),

    /// Frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// The other end of a channel is gone
    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, MeshError>;
