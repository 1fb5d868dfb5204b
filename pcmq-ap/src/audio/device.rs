//! Device session interface
//!
//! The playback engine talks to audio hardware through two traits:
//!
//! - [`AudioDevice`] opens a session for an exact [`PcmFormat`]
//! - [`DeviceSession`] is the open session: a bounded buffer queue the engine
//!   enqueues filled buffers into, with a completion notification handing
//!   each buffer back once the hardware consumed it
//!
//! Completion and error handlers run in the device's callback context. They
//! must not block, allocate or take contended locks.

use crate::audio::format::PcmFormat;
use crate::error::Result;
use crate::playback::buffer_pool::AudioBuffer;
use std::sync::Arc;
use thiserror::Error;

/// Called by the device with each buffer it finished playing
pub type CompletionHandler = Arc<dyn Fn(AudioBuffer) + Send + Sync + 'static>;

/// Called by the device when the output stream fails asynchronously
pub type DeviceErrorHandler = Arc<dyn Fn(String) + Send + Sync + 'static>;

/// Reasons a device queue rejects a buffer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Queue already holds `capacity` buffers (caller contract violation)
    #[error("Device queue full ({capacity} buffers)")]
    Full { capacity: usize },

    /// Session was closed
    #[error("Device session closed")]
    Closed,

    /// Zero-length buffers are never handed to hardware
    #[error("Buffer {id} has no valid bytes")]
    EmptyBuffer { id: usize },

    /// Device-specific rejection
    #[error("Device rejected buffer: {0}")]
    Rejected(String),
}

/// Failed enqueue; the buffer is handed back to the caller
pub struct EnqueueError {
    pub buffer: AudioBuffer,
    pub error: QueueError,
}

impl std::fmt::Debug for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueError")
            .field("buffer_id", &self.buffer.id())
            .field("error", &self.error)
            .finish()
    }
}

/// Parameters for opening a device session
#[derive(Clone)]
pub struct SessionRequest {
    /// Exact format to play; no conversion is performed
    pub format: PcmFormat,
    /// Maximum buffers queued at once (the pool size)
    pub queue_depth: usize,
    /// Completion notification target
    pub on_complete: CompletionHandler,
    /// Asynchronous stream failure target
    pub on_error: DeviceErrorHandler,
}

impl std::fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRequest")
            .field("format", &self.format)
            .field("queue_depth", &self.queue_depth)
            .finish()
    }
}

/// An output device able to open buffer-queue sessions
pub trait AudioDevice: Send + Sync {
    /// Human-readable device description (for logs)
    fn describe(&self) -> String;

    /// Open a session for exactly `request.format`
    ///
    /// # Errors
    /// - `UnsupportedFormat` if the device cannot play the format natively
    /// - `Device` if the device cannot be opened
    fn open(&self, request: SessionRequest) -> Result<Box<dyn DeviceSession>>;
}

/// An open device session
///
/// `close` is idempotent and must be called on every exit path; dropping a
/// session also closes it.
pub trait DeviceSession: Send {
    /// Begin consuming queued buffers
    fn start(&mut self) -> Result<()>;

    /// Hand one filled buffer to the hardware queue
    fn enqueue(&mut self, buffer: AudioBuffer) -> std::result::Result<(), EnqueueError>;

    /// Buffers currently held by the device
    fn queued(&self) -> usize;

    /// Flush pending buffers and release the device
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Device callbacks that found no queued audio
    fn underruns(&self) -> u64 {
        0
    }
}
