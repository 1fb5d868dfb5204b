//! Playback engine
//!
//! Runs one playback session: opens the device session, primes the buffer
//! queue, then keeps the device fed until end of stream, stop or failure.
//!
//! ## Threads of control
//!
//! - **Control thread** (the caller of [`PlaybackSession::start`] and
//!   [`PlaybackSession::stop`]): opens the source and device and performs
//!   priming synchronously, so open and priming errors are returned directly.
//! - **Feeder thread** (`pcmq-feeder`): performs every refill after priming.
//!   It parks between passes and is unparked when a slot is freed.
//! - **Device callback context**: the completion handler only touches
//!   atomics, the lock-free pool and the feeder's park token.
//!
//! The session state cell is the single source of truth for all three. The
//! device session sits behind a mutex that only the control and feeder
//! threads take; the feeder re-checks the state under that mutex before every
//! enqueue, and `stop()` stores the new state before taking it to close the
//! device.

use crate::audio::device::{AudioDevice, DeviceSession, SessionRequest};
use crate::audio::format::PcmFormat;
use crate::audio::source::PcmSource;
use crate::error::{Error, Result};
use crate::playback::buffer_pool::{AudioBuffer, BufferPool, PoolCounts};
use crate::playback::lock_unpoisoned;
use crate::playback::state::SessionStateCell;
use crossbeam::queue::ArrayQueue;
use pcmq_common::{EventBus, PlayerEvent, SessionState};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Smallest supported buffer pool (double buffering)
pub const MIN_BUFFER_COUNT: usize = 2;

/// Largest supported buffer pool
pub const MAX_BUFFER_COUNT: usize = 8;

/// Largest buffer capacity in frames (one second at 192 kHz)
pub const MAX_BUFFER_FRAMES: usize = 192_000;

/// Buffer queue geometry and stream format of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub format: PcmFormat,
    /// Buffers in the pool, also the device queue depth (N)
    pub buffer_count: usize,
    /// Capacity of each buffer in frames
    pub buffer_frames: usize,
}

impl SessionParams {
    pub fn validate(&self) -> Result<()> {
        self.format.validate()?;
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            return Err(Error::Config(format!(
                "buffer count must be between {} and {}, got {}",
                MIN_BUFFER_COUNT, MAX_BUFFER_COUNT, self.buffer_count
            )));
        }
        if self.buffer_frames == 0 {
            return Err(Error::Config(
                "buffer size must be at least one frame".to_string(),
            ));
        }
        if self.buffer_frames > MAX_BUFFER_FRAMES {
            return Err(Error::Config(format!(
                "buffer size must be at most {} frames, got {}",
                MAX_BUFFER_FRAMES, self.buffer_frames
            )));
        }
        self.checked_buffer_bytes().ok_or_else(|| {
            Error::Config(format!(
                "buffer of {} frames does not fit in memory",
                self.buffer_frames
            ))
        })?;
        Ok(())
    }

    /// Capacity of each buffer in bytes
    ///
    /// Saturates for geometries that `validate` rejects.
    pub fn buffer_bytes(&self) -> usize {
        self.checked_buffer_bytes().unwrap_or(usize::MAX)
    }

    /// Per-buffer size, or None if it or the whole pool overflows usize
    fn checked_buffer_bytes(&self) -> Option<usize> {
        let bytes = self
            .buffer_frames
            .checked_mul(self.format.bytes_per_frame())?;
        bytes.checked_mul(self.buffer_count)?;
        Some(bytes)
    }
}

/// Progress counters of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStats {
    pub buffers_enqueued: u64,
    pub bytes_enqueued: u64,
    pub bytes_played: u64,
    pub underruns: u64,
}

/// Pending device faults kept for the feeder; later ones are dropped
const MAX_PENDING_FAULTS: usize = 4;

/// Wakes the feeder thread from the callback context without locking
///
/// Freed slots need no message: the feeder re-reads the pool after every
/// wake-up. Faults carry a reason, so they go through a bounded queue.
struct FeederWake {
    thread: OnceLock<Thread>,
    faults: ArrayQueue<String>,
}

impl FeederWake {
    fn new() -> Self {
        Self {
            thread: OnceLock::new(),
            faults: ArrayQueue::new(MAX_PENDING_FAULTS),
        }
    }

    /// Called by the feeder before its first pass
    fn register(&self, thread: Thread) {
        let _ = self.thread.set(thread);
    }

    fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    fn fault(&self, reason: String) {
        // Full: the session is already failing
        let _ = self.faults.push(reason);
        self.wake();
    }

    fn take_fault(&self) -> Option<String> {
        self.faults.pop()
    }
}

/// Session state reachable from the device callback context
///
/// Holds no reference to the device session, so the handlers the device keeps
/// never form a cycle with it.
struct SessionCore {
    id: Uuid,
    format: PcmFormat,
    state: SessionStateCell,
    pool: BufferPool,
    /// Buffers handed to the device and not yet completed
    in_flight: AtomicUsize,
    buffers_enqueued: AtomicU64,
    bytes_enqueued: AtomicU64,
    bytes_played: AtomicU64,
    last_error: Mutex<Option<String>>,
    events: Arc<EventBus>,
    wake: FeederWake,
    finished: Mutex<bool>,
    finished_cv: Condvar,
}

impl SessionCore {
    /// Device completion handler body (callback context)
    fn on_buffer_complete(&self, buffer: AudioBuffer) {
        if !self.state.accepts_completions() {
            // Session over: the buffer is dropped with the pool
            return;
        }

        self.bytes_played
            .fetch_add(buffer.valid_bytes() as u64, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        match self.pool.release(buffer) {
            Ok(()) => self.wake.wake(),
            Err(e) => self.wake.fault(e.to_string()),
        }
    }

    /// Device error handler body (callback context)
    fn on_device_error(&self, reason: String) {
        self.wake.fault(reason);
    }

    fn emit(&self, event: PlayerEvent) {
        self.events.emit_lossy(event);
    }

    fn emit_state_change(&self, old_state: SessionState, new_state: SessionState) {
        debug!("Session {}: {} -> {}", self.id, old_state, new_state);
        self.emit(PlayerEvent::StateChanged {
            session_id: self.id,
            old_state,
            new_state,
            timestamp: chrono::Utc::now(),
        });
        if new_state.is_terminal() {
            let mut finished = lock_unpoisoned(&self.finished);
            *finished = true;
            self.finished_cv.notify_all();
        }
    }

    /// CAS `from → to` and publish the change
    fn change_state(&self, from: SessionState, to: SessionState) -> bool {
        if self.state.transition(from, to) {
            self.emit_state_change(from, to);
            true
        } else {
            false
        }
    }

    /// Move to a terminal state from any live state and publish the change
    fn terminate(&self, to: SessionState) -> Option<SessionState> {
        let previous = self.state.terminate(to)?;
        self.emit_state_change(previous, to);
        Some(previous)
    }

    fn set_last_error(&self, reason: &str) {
        *lock_unpoisoned(&self.last_error) = Some(reason.to_string());
    }

    fn stats(&self, underruns: u64) -> PlaybackStats {
        PlaybackStats {
            buffers_enqueued: self.buffers_enqueued.load(Ordering::Relaxed),
            bytes_enqueued: self.bytes_enqueued.load(Ordering::Relaxed),
            bytes_played: self.bytes_played.load(Ordering::Relaxed),
            underruns,
        }
    }

    fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = lock_unpoisoned(&self.finished);
        while !*finished {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            finished = match self.finished_cv.wait_timeout(finished, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// Parts shared between the control thread and the feeder
struct SessionIo {
    core: Arc<SessionCore>,
    device: Mutex<Box<dyn DeviceSession>>,
}

/// Outcome of one feeder pass
enum Pass {
    /// Park until the next wake-up
    Idle,
    /// Session is over; feeder exits
    Finished,
}

impl SessionIo {
    /// Hand a filled buffer to the device
    ///
    /// The state is checked under the device lock so nothing is enqueued
    /// after `stop()` stored its state. Returns Ok(false) if the session is no
    /// longer `expected`; the buffer then goes back to the pool.
    fn enqueue(&self, buffer: AudioBuffer, expected: SessionState) -> Result<bool> {
        let core = &self.core;
        let mut device = lock_unpoisoned(&self.device);

        if core.state.load() != expected {
            core.pool.release(buffer)?;
            return Ok(false);
        }

        core.pool.mark_queued(&buffer)?;
        let bytes = buffer.valid_bytes() as u64;

        // Count first: the completion may arrive before enqueue returns
        core.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(failed) = device.enqueue(buffer) {
            core.in_flight.fetch_sub(1, Ordering::AcqRel);
            core.pool.release(failed.buffer)?;
            return Err(Error::Queue(failed.error));
        }

        core.buffers_enqueued.fetch_add(1, Ordering::Relaxed);
        core.bytes_enqueued.fetch_add(bytes, Ordering::Relaxed);
        Ok(true)
    }

    fn close_device(&self) {
        let mut device = lock_unpoisoned(&self.device);
        if !device.is_closed() {
            device.close();
            debug!("Session {}: device closed", self.core.id);
        }
    }

    fn underruns(&self) -> u64 {
        lock_unpoisoned(&self.device).underruns()
    }

    /// Terminate with Failed, close the device and publish the reason
    fn fail(&self, reason: String, notify: bool) {
        let core = &self.core;
        if core.terminate(SessionState::Failed).is_some() {
            error!("Session {} failed: {}", core.id, reason);
            core.set_last_error(&reason);
            self.close_device();
            if notify {
                core.emit(PlayerEvent::PlaybackFailed {
                    session_id: core.id,
                    reason,
                    timestamp: chrono::Utc::now(),
                });
            }
        } else {
            // Already stopped or failed; the session outcome stands
            debug!("Session {}: ignoring late failure: {}", core.id, reason);
            self.close_device();
        }
    }

    /// Return an unused buffer to the pool
    ///
    /// A pool error means the ownership invariant is broken; the session
    /// fails and false is returned.
    fn recycle(&self, buffer: AudioBuffer) -> bool {
        match self.core.pool.release(buffer) {
            Ok(()) => true,
            Err(e) => {
                self.fail(e.to_string(), true);
                false
            }
        }
    }

    /// Draining with nothing queued: close and report completion
    fn finish(&self) {
        let core = &self.core;
        if core.change_state(SessionState::Draining, SessionState::Stopped) {
            self.close_device();
            let bytes_played = core.bytes_played.load(Ordering::Relaxed);
            info!(
                "Session {} completed: {} bytes played ({:.2}s)",
                core.id,
                bytes_played,
                core.format.duration_of(bytes_played).as_secs_f64()
            );
            core.emit(PlayerEvent::PlaybackCompleted {
                session_id: core.id,
                bytes_played,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Refill every free slot, or detect the end of drain
    fn service<R: std::io::Read>(&self, source: &mut PcmSource<R>) -> Pass {
        let core = &self.core;

        if core.state.load() == SessionState::Playing {
            while let Some(mut buffer) = core.pool.acquire_free() {
                let filled = match source.fill(&mut buffer) {
                    Ok(n) => n,
                    Err(e) => {
                        if let Err(pool_error) = core.pool.release(buffer) {
                            warn!("Session {}: {}", core.id, pool_error);
                        }
                        self.fail(e.to_string(), true);
                        return Pass::Finished;
                    }
                };

                if filled == 0 {
                    if !self.recycle(buffer) {
                        return Pass::Finished;
                    }
                    if !core.change_state(SessionState::Playing, SessionState::Draining) {
                        return Pass::Finished;
                    }
                    break;
                }

                match self.enqueue(buffer, SessionState::Playing) {
                    Ok(true) => {}
                    Ok(false) => return Pass::Finished,
                    Err(e) => {
                        self.fail(e.to_string(), true);
                        return Pass::Finished;
                    }
                }

                if source.at_end() {
                    if !core.change_state(SessionState::Playing, SessionState::Draining) {
                        return Pass::Finished;
                    }
                    break;
                }
            }
        }

        match core.state.load() {
            SessionState::Draining => {
                if core.in_flight.load(Ordering::Acquire) == 0 {
                    self.finish();
                    Pass::Finished
                } else {
                    Pass::Idle
                }
            }
            SessionState::Stopped | SessionState::Failed => Pass::Finished,
            _ => Pass::Idle,
        }
    }
}

fn feeder_run<R: std::io::Read>(io: Arc<SessionIo>, mut source: PcmSource<R>) {
    let wake = &io.core.wake;
    wake.register(thread::current());
    debug!("Feeder started for session {}", io.core.id);

    loop {
        if let Some(reason) = wake.take_fault() {
            io.fail(reason, true);
            break;
        }

        if let Pass::Finished = io.service(&mut source) {
            break;
        }

        // Spurious returns only cause an extra pass
        thread::park();
    }

    debug!(
        "Feeder exiting for session {} (cursor={})",
        io.core.id,
        source.cursor()
    );
}

/// Waits for a session to reach Stopped or Failed
pub struct FinishWaiter {
    core: Arc<SessionCore>,
}

impl FinishWaiter {
    /// Returns false if `timeout` elapsed first
    pub fn wait(&self, timeout: Duration) -> bool {
        self.core.wait_finished(timeout)
    }
}

/// One playback session: a source file streamed through a device session
///
/// Dropping the session stops it.
pub struct PlaybackSession {
    io: Arc<SessionIo>,
    path: PathBuf,
    feeder: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.io.core.id)
            .field("path", &self.path)
            .field("state", &self.io.core.state.load())
            .finish()
    }
}

impl PlaybackSession {
    /// Open `path` and the device, prime the queue and start playback
    ///
    /// Priming runs on the calling thread. Every error before the feeder is
    /// running is returned here and leaves no device session open.
    ///
    /// # Errors
    /// `NotFound`, `UnsupportedFormat`, `Device`, `Io`, `Queue`, `Config`
    pub fn start(
        device: &dyn AudioDevice,
        path: impl AsRef<Path>,
        params: SessionParams,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let path = path.as_ref();
        params.validate()?;
        let source = PcmSource::open(path)?;
        Self::start_with_source(device, source, params, events)
    }

    /// Start a session over an already-open source
    pub fn start_with_source<R: std::io::Read + Send + 'static>(
        device: &dyn AudioDevice,
        mut source: PcmSource<R>,
        params: SessionParams,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        params.validate()?;
        let path = source.path().to_path_buf();
        let pool = BufferPool::new(params.buffer_count, params.buffer_bytes())?;

        let core = Arc::new(SessionCore {
            id: Uuid::new_v4(),
            format: params.format,
            state: SessionStateCell::new(SessionState::Idle),
            pool,
            in_flight: AtomicUsize::new(0),
            buffers_enqueued: AtomicU64::new(0),
            bytes_enqueued: AtomicU64::new(0),
            bytes_played: AtomicU64::new(0),
            last_error: Mutex::new(None),
            events,
            wake: FeederWake::new(),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
        });

        info!(
            "Starting session {}: {} ({}, {} x {} frames{})",
            core.id,
            path.display(),
            params.format,
            params.buffer_count,
            params.buffer_frames,
            source
                .len_hint()
                .map(|len| format!(
                    ", {:.2}s",
                    params.format.duration_of(len).as_secs_f64()
                ))
                .unwrap_or_default()
        );
        core.emit(PlayerEvent::SessionStarted {
            session_id: core.id,
            path: path.display().to_string(),
            format: params.format.to_string(),
            timestamp: chrono::Utc::now(),
        });
        core.change_state(SessionState::Idle, SessionState::Priming);

        let request = {
            let on_complete = Arc::clone(&core);
            let on_error = Arc::clone(&core);
            SessionRequest {
                format: params.format,
                queue_depth: params.buffer_count,
                on_complete: Arc::new(move |buffer| on_complete.on_buffer_complete(buffer)),
                on_error: Arc::new(move |reason| on_error.on_device_error(reason)),
            }
        };

        let device_session = match device.open(request) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to open {}: {}", device.describe(), e);
                core.set_last_error(&e.to_string());
                core.terminate(SessionState::Failed);
                return Err(e);
            }
        };

        let io = Arc::new(SessionIo {
            core: Arc::clone(&core),
            device: Mutex::new(device_session),
        });

        if let Err(e) = Self::prime(&io, &mut source) {
            io.fail(e.to_string(), false);
            return Err(e);
        }

        let mut session = Self {
            io: Arc::clone(&io),
            path,
            feeder: None,
        };

        if core.in_flight.load(Ordering::Acquire) == 0 {
            // Empty stream: drains immediately with nothing queued
            info!("Session {}: source is empty", core.id);
            if core.change_state(SessionState::Priming, SessionState::Draining) {
                io.finish();
            }
            return Ok(session);
        }

        let next = if source.at_end() {
            SessionState::Draining
        } else {
            SessionState::Playing
        };
        core.change_state(SessionState::Priming, next);

        let feeder_io = Arc::clone(&io);
        let handle = thread::Builder::new()
            .name("pcmq-feeder".to_string())
            .spawn(move || feeder_run(feeder_io, source))
            .map_err(|e| Error::Device(format!("Failed to spawn feeder thread: {}", e)));

        match handle {
            Ok(handle) => session.feeder = Some(handle),
            Err(e) => {
                io.fail(e.to_string(), false);
                return Err(e);
            }
        }

        let started = lock_unpoisoned(&io.device).start();
        if let Err(e) = started {
            io.fail(e.to_string(), false);
            // Dropping the session shuts the feeder down
            return Err(e);
        }

        Ok(session)
    }

    /// Fill and enqueue up to N buffers
    fn prime<R: std::io::Read>(io: &SessionIo, source: &mut PcmSource<R>) -> Result<()> {
        let core = &io.core;
        while !source.at_end() {
            let Some(mut buffer) = core.pool.acquire_free() else {
                break;
            };

            let filled = match source.fill(&mut buffer) {
                Ok(n) => n,
                Err(e) => {
                    core.pool.release(buffer)?;
                    return Err(e);
                }
            };

            if filled == 0 {
                core.pool.release(buffer)?;
                break;
            }

            if !io.enqueue(buffer, SessionState::Priming)? {
                return Err(Error::InvalidState(
                    "session stopped during priming".to_string(),
                ));
            }
        }

        debug!(
            "Session {}: primed {} buffers ({} bytes)",
            core.id,
            core.in_flight.load(Ordering::Acquire),
            core.bytes_enqueued.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Stop playback; idempotent
    ///
    /// The state is set to Stopped before the device is closed, so callbacks
    /// already in flight see it and do nothing. Returns once the feeder has
    /// exited.
    pub fn stop(&mut self) {
        let core = &self.io.core;
        if let Some(previous) = core.terminate(SessionState::Stopped) {
            info!("Session {} stopped (was {})", core.id, previous);
            core.emit(PlayerEvent::PlaybackStopped {
                session_id: core.id,
                timestamp: chrono::Utc::now(),
            });
        }
        self.io.close_device();
        // The feeder sees the terminal state on its next pass
        core.wake.wake();
        self.join_feeder();
    }

    fn join_feeder(&mut self) {
        if let Some(handle) = self.feeder.take() {
            if handle.join().is_err() {
                error!("Feeder thread for session {} panicked", self.io.core.id);
            }
        }
    }

    /// Block until the session reaches Stopped or Failed
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_until_finished(&self, timeout: Duration) -> bool {
        self.io.core.wait_finished(timeout)
    }

    /// Waiter usable after releasing any lock around the session
    pub fn finish_waiter(&self) -> FinishWaiter {
        FinishWaiter {
            core: Arc::clone(&self.io.core),
        }
    }

    pub fn id(&self) -> Uuid {
        self.io.core.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> PcmFormat {
        self.io.core.format
    }

    pub fn state(&self) -> SessionState {
        self.io.core.state.load()
    }

    /// Duration of audio the device has finished playing
    pub fn position(&self) -> Duration {
        let core = &self.io.core;
        core.format
            .duration_of(core.bytes_played.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> PlaybackStats {
        self.io.core.stats(self.io.underruns())
    }

    /// Ownership snapshot of the session's buffer pool
    pub fn pool_counts(&self) -> PoolCounts {
        self.io.core.pool.counts()
    }

    /// Reason of the failure that ended the session, if any
    pub fn last_error(&self) -> Option<String> {
        lock_unpoisoned(&self.io.core.last_error).clone()
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::SimulatedDevice;
    use crate::playback::buffer_pool::BufferOwner;
    use std::io::Cursor;

    fn params(buffer_count: usize, buffer_frames: usize) -> SessionParams {
        SessionParams {
            format: PcmFormat::CD_QUALITY,
            buffer_count,
            buffer_frames,
        }
    }

    fn memory_source(len: usize) -> PcmSource<Cursor<Vec<u8>>> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        PcmSource::from_reader(Cursor::new(data), "memory.pcm")
    }

    #[test]
    fn test_params_validation() {
        assert!(params(2, 1).validate().is_ok());
        assert!(params(8, 1).validate().is_ok());
        assert!(matches!(params(1, 1).validate(), Err(Error::Config(_))));
        assert!(matches!(params(9, 1).validate(), Err(Error::Config(_))));
        assert!(matches!(params(2, 0).validate(), Err(Error::Config(_))));
        assert_eq!(params(2, 10).buffer_bytes(), 40);
    }

    #[test]
    fn test_params_reject_oversized_buffers() {
        assert!(params(8, MAX_BUFFER_FRAMES).validate().is_ok());
        assert!(matches!(
            params(2, MAX_BUFFER_FRAMES + 1).validate(),
            Err(Error::Config(_))
        ));

        // Frame count whose byte size overflows
        let huge = params(2, usize::MAX / 2);
        assert!(matches!(huge.validate(), Err(Error::Config(_))));
        assert_eq!(huge.buffer_bytes(), usize::MAX);
    }

    #[test]
    fn test_priming_fills_every_slot() {
        let device = SimulatedDevice::manual();
        let session = PlaybackSession::start_with_source(
            &device,
            memory_source(100),
            params(3, 4),
            Arc::new(EventBus::default()),
        )
        .unwrap();

        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(device.queued(), 3);
        assert_eq!(device.record().enqueued_sizes, vec![16, 16, 16]);

        let counts = session.pool_counts();
        assert_eq!(counts.queued, 3);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_completion_after_stop_is_noop() {
        let device = SimulatedDevice::manual();
        let mut session = PlaybackSession::start_with_source(
            &device,
            memory_source(100),
            params(2, 4),
            Arc::new(EventBus::default()),
        )
        .unwrap();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);

        // A buffer the device still held when it was closed
        let core = Arc::clone(&session.io.core);
        let before = core.pool.counts();
        let straggler = BufferPool::new(1, 16).unwrap().acquire_free().unwrap();
        core.on_buffer_complete(straggler);

        assert_eq!(core.pool.counts(), before);
        assert_eq!(core.bytes_played.load(Ordering::Relaxed), 0);
        assert_eq!(core.in_flight.load(Ordering::Acquire), 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let device = SimulatedDevice::manual();
        let mut session = PlaybackSession::start_with_source(
            &device,
            memory_source(1000),
            params(2, 4),
            Arc::new(EventBus::default()),
        )
        .unwrap();

        session.stop();
        session.stop();
        drop(session);
        assert_eq!(device.record().close_calls, 1);
    }

    #[test]
    fn test_enqueue_failure_during_priming_returns_buffer() {
        let device = SimulatedDevice::manual();
        device.fail_enqueue_at(2);

        let result = PlaybackSession::start_with_source(
            &device,
            memory_source(100),
            params(2, 4),
            Arc::new(EventBus::default()),
        );

        assert!(matches!(result, Err(Error::Queue(_))));
        assert!(!device.is_open());
        assert_eq!(device.record().close_calls, 1);
    }

    #[test]
    fn test_end_of_stream_in_feeder_returns_buffer_to_pool() {
        let device = SimulatedDevice::manual();
        let session = PlaybackSession::start_with_source(
            &device,
            memory_source(48),
            params(2, 4),
            Arc::new(EventBus::default()),
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Playing);

        // Third buffer refills; the fourth fill reads nothing
        assert!(device.complete_next());
        assert!(device.complete_next());
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.state() == SessionState::Playing && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(session.state(), SessionState::Draining);
        assert_eq!(device.record().enqueued_sizes, vec![16, 16, 16]);
        let counts = session.pool_counts();
        assert_eq!(counts.filled, 0);
        assert_eq!(counts.free, 1);
        assert_eq!(counts.queued, 1);
    }

    #[test]
    fn test_recycling_foreign_buffer_fails_session() {
        let device = SimulatedDevice::manual();
        let session = PlaybackSession::start_with_source(
            &device,
            memory_source(100),
            params(2, 4),
            Arc::new(EventBus::default()),
        )
        .unwrap();

        let foreign = BufferPool::new(1, 16).unwrap().acquire_free().unwrap();
        assert!(!session.io.recycle(foreign));

        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.last_error().is_some());
        assert!(!device.is_open());
    }

    #[test]
    fn test_feeder_wake_keeps_faults_until_taken() {
        let wake = FeederWake::new();

        // Nothing registered yet: faults are kept, the wake-up is a no-op
        wake.wake();
        for i in 0..MAX_PENDING_FAULTS + 2 {
            wake.fault(format!("fault {}", i));
        }

        wake.register(thread::current());
        wake.wake();
        // Returns at once: the unpark above left the token set
        thread::park();

        assert_eq!(wake.take_fault().as_deref(), Some("fault 0"));
        let mut remaining = 0;
        while wake.take_fault().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, MAX_PENDING_FAULTS - 1);
    }

    #[test]
    fn test_partial_final_buffer_keeps_true_length() {
        let device = SimulatedDevice::manual();
        let session = PlaybackSession::start_with_source(
            &device,
            memory_source(22),
            params(2, 4),
            Arc::new(EventBus::default()),
        )
        .unwrap();

        // 16 + 6 bytes, end of stream seen during priming
        assert_eq!(device.record().enqueued_sizes, vec![16, 6]);
        assert_eq!(session.state(), SessionState::Draining);
        assert_eq!(
            session.io.core.pool.owner(1),
            Some(BufferOwner::QueuedToDevice)
        );

        assert!(device.complete_next());
        assert!(device.complete_next());
        assert!(session.wait_until_finished(Duration::from_secs(5)));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stats().bytes_played, 22);
    }
}
