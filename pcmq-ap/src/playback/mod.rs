//! Playback engine, buffer pool and controller

pub mod buffer_pool;
pub mod controller;
pub mod engine;
pub mod state;

pub use buffer_pool::{AudioBuffer, BufferOwner, BufferPool, BufferPoolError};
pub use controller::PlaybackController;
pub use engine::{PlaybackSession, PlaybackStats, SessionParams};
pub use state::SessionStateCell;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
