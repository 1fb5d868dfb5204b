//! Fixed-size audio buffer pool
//!
//! A session allocates N byte buffers once and recycles them between the
//! source reader, the device queue and back. Each buffer has exactly one
//! owner at a time:
//!
//! ```text
//!   Free ──acquire_free()──→ FilledByReader ──mark_queued()──→ QueuedToDevice
//!    ↑                              │                                │
//!    └──────────release()───────────┴──────────release()─────────────┘
//! ```
//!
//! Ownership of the bytes moves with the `AudioBuffer` value itself; the pool
//! keeps an atomic owner tag per buffer so the `free + filled + queued == N`
//! invariant can be observed from any thread.
//!
//! ## Thread Safety
//!
//! The free list is a fixed-capacity lock-free queue and owner tags are
//! atomics. `release()` is wait-free apart from the queue CAS and never
//! allocates, so it is safe to call from the device callback context.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use thiserror::Error;
use tracing::debug;

/// Source of unique pool identifiers (detects buffers released to the wrong pool)
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Current owner of a pooled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferOwner {
    Free = 0,
    FilledByReader = 1,
    QueuedToDevice = 2,
}

impl BufferOwner {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BufferOwner::Free,
            1 => BufferOwner::FilledByReader,
            _ => BufferOwner::QueuedToDevice,
        }
    }
}

/// Buffer pool ownership violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferPoolError {
    /// Pool created with zero buffers or zero-byte buffers
    #[error("Invalid pool geometry: {count} buffers of {capacity} bytes")]
    InvalidGeometry { count: usize, capacity: usize },

    /// Buffer belongs to a different pool
    #[error("Buffer {id} does not belong to this pool")]
    ForeignBuffer { id: usize },

    /// Transition not allowed from the buffer's current owner
    #[error("Buffer {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: usize,
        from: BufferOwner,
        to: BufferOwner,
    },

    /// Free list already holds every buffer
    #[error("Free list overflow releasing buffer {id}")]
    Overflow { id: usize },
}

/// One fixed-capacity audio buffer
///
/// `valid_bytes` is the number of leading bytes holding audio; the device is
/// always told this length, never the full capacity.
#[derive(Debug)]
pub struct AudioBuffer {
    pool_id: u64,
    id: usize,
    data: Box<[u8]>,
    valid_bytes: usize,
}

impl AudioBuffer {
    /// Index of this buffer inside its pool
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.valid_bytes == 0
    }

    /// The audio bytes handed to the device
    pub fn valid_data(&self) -> &[u8] {
        &self.data[..self.valid_bytes]
    }

    /// Whole backing storage, for the reader to fill
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how many leading bytes hold audio (clamped to capacity)
    pub fn set_valid_bytes(&mut self, valid_bytes: usize) {
        debug_assert!(valid_bytes <= self.data.len());
        self.valid_bytes = valid_bytes.min(self.data.len());
    }
}

/// Snapshot of buffer ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolCounts {
    pub free: usize,
    pub filled: usize,
    pub queued: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.free + self.filled + self.queued
    }
}

/// Pre-allocated pool of N audio buffers
pub struct BufferPool {
    pool_id: u64,
    free: ArrayQueue<AudioBuffer>,
    owners: Box<[AtomicU8]>,
    buffer_capacity: usize,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("pool_id", &self.pool_id)
            .field("buffer_count", &self.owners.len())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("counts", &self.counts())
            .finish()
    }
}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_capacity` bytes each
    ///
    /// This is the only allocation the pool ever performs.
    pub fn new(count: usize, buffer_capacity: usize) -> Result<Self, BufferPoolError> {
        if count == 0 || buffer_capacity == 0 {
            return Err(BufferPoolError::InvalidGeometry {
                count,
                capacity: buffer_capacity,
            });
        }

        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let free = ArrayQueue::new(count);
        for id in 0..count {
            let buffer = AudioBuffer {
                pool_id,
                id,
                data: vec![0u8; buffer_capacity].into_boxed_slice(),
                valid_bytes: 0,
            };
            // Capacity is exactly `count`, so this cannot fail
            let _ = free.push(buffer);
        }

        let owners = (0..count)
            .map(|_| AtomicU8::new(BufferOwner::Free as u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            "Allocated buffer pool {}: {} buffers x {} bytes",
            pool_id, count, buffer_capacity
        );

        Ok(Self {
            pool_id,
            free,
            owners,
            buffer_capacity,
        })
    }

    /// Number of buffers in the pool (N)
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Capacity of each buffer in bytes
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Take a Free buffer for the reader to fill
    ///
    /// Returns `None` when every buffer is filled or queued; the caller waits
    /// for the next device completion instead of polling.
    pub fn acquire_free(&self) -> Option<AudioBuffer> {
        let mut buffer = self.free.pop()?;
        buffer.valid_bytes = 0;
        self.owners[buffer.id].store(BufferOwner::FilledByReader as u8, Ordering::Release);
        Some(buffer)
    }

    /// Record that a filled buffer was handed to the device
    pub fn mark_queued(&self, buffer: &AudioBuffer) -> Result<(), BufferPoolError> {
        let tag = self.owner_tag(buffer)?;
        tag.compare_exchange(
            BufferOwner::FilledByReader as u8,
            BufferOwner::QueuedToDevice as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(|current| BufferPoolError::InvalidTransition {
            id: buffer.id,
            from: BufferOwner::from_u8(current),
            to: BufferOwner::QueuedToDevice,
        })
    }

    /// Return a buffer to the free list
    ///
    /// Safe to call from the device callback context: no locks, no allocation.
    pub fn release(&self, mut buffer: AudioBuffer) -> Result<(), BufferPoolError> {
        let id = buffer.id;
        let tag = self.owner_tag(&buffer)?;

        let previous = tag.swap(BufferOwner::Free as u8, Ordering::AcqRel);
        if previous == BufferOwner::Free as u8 {
            return Err(BufferPoolError::InvalidTransition {
                id,
                from: BufferOwner::Free,
                to: BufferOwner::Free,
            });
        }

        buffer.valid_bytes = 0;
        self.free
            .push(buffer)
            .map_err(|_| BufferPoolError::Overflow { id })
    }

    /// Current owner of buffer `id`
    pub fn owner(&self, id: usize) -> Option<BufferOwner> {
        self.owners
            .get(id)
            .map(|tag| BufferOwner::from_u8(tag.load(Ordering::Acquire)))
    }

    /// Ownership snapshot (exact only when no transition is in flight)
    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for tag in self.owners.iter() {
            match BufferOwner::from_u8(tag.load(Ordering::Acquire)) {
                BufferOwner::Free => counts.free += 1,
                BufferOwner::FilledByReader => counts.filled += 1,
                BufferOwner::QueuedToDevice => counts.queued += 1,
            }
        }
        counts
    }

    fn owner_tag(&self, buffer: &AudioBuffer) -> Result<&AtomicU8, BufferPoolError> {
        if buffer.pool_id != self.pool_id {
            return Err(BufferPoolError::ForeignBuffer { id: buffer.id });
        }
        self.owners
            .get(buffer.id)
            .ok_or(BufferPoolError::ForeignBuffer { id: buffer.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pool_starts_all_free() {
        let pool = BufferPool::new(3, 64).unwrap();

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.buffer_capacity(), 64);
        assert_eq!(
            pool.counts(),
            PoolCounts {
                free: 3,
                filled: 0,
                queued: 0
            }
        );
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        assert!(matches!(
            BufferPool::new(0, 64),
            Err(BufferPoolError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            BufferPool::new(2, 0),
            Err(BufferPoolError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = BufferPool::new(2, 16).unwrap();

        let a = pool.acquire_free().unwrap();
        let b = pool.acquire_free().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(pool.acquire_free().is_none());
        assert_eq!(pool.counts().filled, 2);

        pool.release(a).unwrap();
        assert_eq!(pool.counts().free, 1);
        assert!(pool.acquire_free().is_some());
    }

    #[test]
    fn test_full_ownership_cycle() {
        let pool = BufferPool::new(2, 8).unwrap();

        let mut buffer = pool.acquire_free().unwrap();
        buffer.storage_mut()[..3].copy_from_slice(&[1, 2, 3]);
        buffer.set_valid_bytes(3);
        assert_eq!(buffer.valid_data(), &[1, 2, 3]);
        assert_eq!(pool.owner(buffer.id()), Some(BufferOwner::FilledByReader));

        pool.mark_queued(&buffer).unwrap();
        assert_eq!(pool.owner(buffer.id()), Some(BufferOwner::QueuedToDevice));
        assert_eq!(pool.counts().total(), 2);

        let id = buffer.id();
        pool.release(buffer).unwrap();
        assert_eq!(pool.owner(id), Some(BufferOwner::Free));

        // Recycled buffers come back with no valid bytes
        let again = pool.acquire_free().unwrap();
        assert_eq!(again.valid_bytes(), 0);
    }

    #[test]
    fn test_mark_queued_twice_is_rejected() {
        let pool = BufferPool::new(2, 8).unwrap();
        let buffer = pool.acquire_free().unwrap();

        pool.mark_queued(&buffer).unwrap();
        assert_eq!(
            pool.mark_queued(&buffer),
            Err(BufferPoolError::InvalidTransition {
                id: buffer.id(),
                from: BufferOwner::QueuedToDevice,
                to: BufferOwner::QueuedToDevice,
            })
        );
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let pool_a = BufferPool::new(2, 8).unwrap();
        let pool_b = BufferPool::new(2, 8).unwrap();

        let buffer = pool_a.acquire_free().unwrap();
        let id = buffer.id();
        assert_eq!(
            pool_b.release(buffer),
            Err(BufferPoolError::ForeignBuffer { id })
        );
        // pool_b untouched
        assert_eq!(pool_b.counts().free, 2);
    }

    #[test]
    fn test_valid_bytes_up_to_capacity() {
        let pool = BufferPool::new(1, 4).unwrap();
        let mut buffer = pool.acquire_free().unwrap();
        buffer.set_valid_bytes(4);
        assert_eq!(buffer.valid_bytes(), 4);
        assert_eq!(buffer.capacity(), 4);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_concurrent_recycling_preserves_buffer_count() {
        let pool = Arc::new(BufferPool::new(4, 32).unwrap());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    if let Some(buffer) = pool.acquire_free() {
                        pool.mark_queued(&buffer).unwrap();
                        pool.release(buffer).unwrap();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            pool.counts(),
            PoolCounts {
                free: 4,
                filled: 0,
                queued: 0
            }
        );
    }
}
