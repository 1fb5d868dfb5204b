//! Error types for pcmq-ap
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use crate::audio::device::QueueError;
use crate::playback::buffer_pool::BufferPoolError;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for pcmq-ap module
#[derive(Error, Debug)]
pub enum Error {
    /// Source path missing or unreadable at open time
    #[error("Source not found: {path}: {source}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Device cannot be opened with the requested PCM format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Mid-stream read failure
    #[error("Read error at byte {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// Audio output device errors (open, start, stream failure)
    #[error("Audio device error: {0}")]
    Device(String),

    /// Device buffer queue rejected a buffer
    #[error("Buffer queue error: {0}")]
    Queue(#[from] QueueError),

    /// Buffer pool ownership violation
    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),

    /// A session is already priming, playing or draining
    #[error("Playback already in progress (session {0})")]
    AlreadyPlaying(Uuid),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid player configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from the shared crate (configuration file loading)
    #[error(transparent)]
    Common(#[from] pcmq_common::Error),
}

/// Convenience Result type using pcmq-ap Error
pub type Result<T> = std::result::Result<T, Error>;
