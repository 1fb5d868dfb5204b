//! # pcmq Common Library
//!
//! Shared code for the pcmq audio player including:
//! - Error types
//! - Bootstrap configuration (TOML file + compiled defaults)
//! - Player event definitions and the broadcast EventBus

pub mod config;
pub mod error;
pub mod events;
pub mod sample;

pub use error::{Error, Result};
pub use events::{EventBus, PlayerEvent, SessionState};
pub use sample::SampleEncoding;
