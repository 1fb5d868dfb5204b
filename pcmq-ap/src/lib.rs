//! # pcmq Audio Player Library (pcmq-ap)
//!
//! Plays raw (headerless) PCM files through a fixed pool of buffers queued to
//! the audio output device.
//!
//! **Purpose:** keep the output device continuously fed from storage with no
//! allocation or blocking in the device callback.
//!
//! **Architecture:** source reader → buffer pool → device buffer queue (cpal),
//! with a feeder thread refilling slots as the device completes them.

pub mod audio;
pub mod config;
pub mod error;
pub mod playback;
pub mod runtime;

pub use audio::{AudioDevice, CpalDevice, PcmFormat, SimulatedDevice};
pub use config::{ConfigOverrides, PlayerConfig};
pub use error::{Error, Result};
pub use playback::{PlaybackController, PlaybackStats};
