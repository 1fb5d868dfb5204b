//! Simulated output device
//!
//! An in-process [`AudioDevice`] with no hardware behind it. Used for
//! `--dry-run` and by tests to drive sessions deterministically.
//!
//! Two completion modes:
//!
//! - `Manual`: buffers stay queued until [`SimulatedDevice::complete_next`]
//! - `Timed`: a clock thread completes each buffer after its playback
//!   duration (divided by a speed factor)
//!
//! Everything the device observes is recorded: opened formats, enqueue
//! sizes, played bytes in completion order, close calls and the highest
//! queue depth reached.

use crate::audio::device::{
    AudioDevice, CompletionHandler, DeviceErrorHandler, DeviceSession, EnqueueError, QueueError,
    SessionRequest,
};
use crate::audio::format::PcmFormat;
use crate::error::{Error, Result};
use crate::playback::buffer_pool::AudioBuffer;
use crate::playback::lock_unpoisoned as lock;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Poll interval of the timed clock while the queue is empty
const IDLE_POLL: Duration = Duration::from_millis(1);

/// How a simulated session completes buffers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompletionMode {
    /// Completions only happen on `complete_next`
    Manual,
    /// Completions follow the stream clock, `speed` times faster than real time
    Timed { speed: f64 },
}

/// Everything the device observed, across sessions
#[derive(Debug, Default, Clone)]
pub struct SimulatedRecord {
    pub opened_formats: Vec<PcmFormat>,
    pub enqueued_sizes: Vec<usize>,
    pub played: Vec<u8>,
    pub completions: usize,
    pub close_calls: usize,
    pub max_queued: usize,
}

#[derive(Default)]
struct SimulatedConfig {
    /// None = every valid format is accepted
    supported: Option<Vec<PcmFormat>>,
    /// 1-based enqueue index (per session) that gets rejected
    fail_enqueue_at: Option<usize>,
    fail_start: Option<String>,
}

struct SimulatedInner {
    mode: CompletionMode,
    config: Mutex<SimulatedConfig>,
    record: Mutex<SimulatedRecord>,
    active: Mutex<Option<Arc<SessionShared>>>,
}

/// In-process output device
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<SimulatedInner>,
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl SimulatedDevice {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            inner: Arc::new(SimulatedInner {
                mode,
                config: Mutex::new(SimulatedConfig::default()),
                record: Mutex::new(SimulatedRecord::default()),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn manual() -> Self {
        Self::new(CompletionMode::Manual)
    }

    /// Timed device running `speed` times faster than real time
    pub fn timed(speed: f64) -> Self {
        Self::new(CompletionMode::Timed { speed })
    }

    /// Restrict the formats `open` accepts
    pub fn with_supported_formats(self, formats: Vec<PcmFormat>) -> Self {
        lock(&self.inner.config).supported = Some(formats);
        self
    }

    /// Reject the `n`th enqueue (1-based) of every session
    pub fn fail_enqueue_at(&self, n: usize) {
        lock(&self.inner.config).fail_enqueue_at = Some(n);
    }

    /// Make `start` fail with a device error
    pub fn fail_start(&self, reason: impl Into<String>) {
        lock(&self.inner.config).fail_start = Some(reason.into());
    }

    /// Complete the oldest queued buffer of the open session
    ///
    /// Returns false when no session is open or nothing is queued.
    pub fn complete_next(&self) -> bool {
        match self.active_session() {
            Some(session) => session.complete_front(&self.inner),
            None => false,
        }
    }

    /// Report an asynchronous stream failure on the open session
    pub fn inject_stream_error(&self, reason: impl Into<String>) -> bool {
        match self.active_session() {
            Some(session) => {
                (session.on_error)(reason.into());
                true
            }
            None => false,
        }
    }

    /// Buffers queued in the open session (0 if none is open)
    pub fn queued(&self) -> usize {
        self.active_session()
            .map(|session| lock(&session.queue).len())
            .unwrap_or(0)
    }

    /// True while a session is open
    pub fn is_open(&self) -> bool {
        self.active_session().is_some()
    }

    /// Snapshot of everything recorded so far
    pub fn record(&self) -> SimulatedRecord {
        lock(&self.inner.record).clone()
    }

    fn active_session(&self) -> Option<Arc<SessionShared>> {
        lock(&self.inner.active).clone()
    }
}

impl AudioDevice for SimulatedDevice {
    fn describe(&self) -> String {
        match self.inner.mode {
            CompletionMode::Manual => "simulated:manual".to_string(),
            CompletionMode::Timed { speed } => format!("simulated:timed(x{})", speed),
        }
    }

    fn open(&self, request: SessionRequest) -> Result<Box<dyn DeviceSession>> {
        if let Some(supported) = &lock(&self.inner.config).supported {
            if !supported.contains(&request.format) {
                return Err(Error::UnsupportedFormat(format!(
                    "simulated device cannot play {}",
                    request.format
                )));
            }
        }

        let mut active = lock(&self.inner.active);
        if active.is_some() {
            return Err(Error::Device("Simulated device is busy".to_string()));
        }

        let shared = Arc::new(SessionShared {
            format: request.format,
            capacity: request.queue_depth,
            queue: Mutex::new(VecDeque::with_capacity(request.queue_depth)),
            on_complete: request.on_complete,
            on_error: request.on_error,
            enqueues: Mutex::new(0),
            started: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
        });
        *active = Some(Arc::clone(&shared));
        drop(active);

        lock(&self.inner.record).opened_formats.push(request.format);
        debug!("Simulated session opened ({})", request.format);

        Ok(Box::new(SimulatedSession {
            device: Arc::clone(&self.inner),
            shared,
            clock: None,
            closed: false,
        }))
    }
}

struct SessionShared {
    format: PcmFormat,
    capacity: usize,
    queue: Mutex<VecDeque<AudioBuffer>>,
    on_complete: CompletionHandler,
    on_error: DeviceErrorHandler,
    enqueues: Mutex<usize>,
    started: AtomicBool,
    underruns: AtomicU64,
}

impl SessionShared {
    /// Pop the oldest buffer and hand it to the completion handler
    fn complete_front(&self, device: &SimulatedInner) -> bool {
        let Some(buffer) = lock(&self.queue).pop_front() else {
            return false;
        };

        {
            let mut record = lock(&device.record);
            record.played.extend_from_slice(buffer.valid_data());
            record.completions += 1;
        }
        trace!("Simulated completion of buffer {}", buffer.id());
        (self.on_complete)(buffer);
        true
    }
}

struct Clock {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<()>,
}

struct SimulatedSession {
    device: Arc<SimulatedInner>,
    shared: Arc<SessionShared>,
    clock: Option<Clock>,
    closed: bool,
}

impl SimulatedSession {
    fn spawn_clock(&self, speed: f64) -> Result<Clock> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let device = Arc::clone(&self.device);
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name("pcmq-sim-clock".to_string())
            .spawn(move || clock_run(device, shared, speed, shutdown_rx))
            .map_err(|e| Error::Device(format!("Failed to spawn simulated clock: {}", e)))?;

        Ok(Clock {
            shutdown_tx,
            handle,
        })
    }
}

fn clock_run(
    device: Arc<SimulatedInner>,
    shared: Arc<SessionShared>,
    speed: f64,
    shutdown_rx: Receiver<()>,
) {
    let mut starved = false;

    loop {
        let front = lock(&shared.queue).front().map(|b| b.valid_bytes());
        let wait = match front {
            Some(bytes) => {
                starved = false;
                shared
                    .format
                    .duration_of(bytes as u64)
                    .div_f64(speed.max(f64::MIN_POSITIVE))
            }
            None => {
                if !starved {
                    starved = true;
                    shared.underruns.fetch_add(1, Ordering::Relaxed);
                }
                IDLE_POLL
            }
        };

        match shutdown_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                if front.is_some() {
                    shared.complete_front(&device);
                }
            }
            _ => break,
        }
    }
}

impl DeviceSession for SimulatedSession {
    fn start(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Device("Session already closed".to_string()));
        }
        if let Some(reason) = lock(&self.device.config).fail_start.clone() {
            return Err(Error::Device(reason));
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let CompletionMode::Timed { speed } = self.device.mode {
            self.clock = Some(self.spawn_clock(speed)?);
        }
        debug!("Simulated session started");
        Ok(())
    }

    fn enqueue(&mut self, buffer: AudioBuffer) -> std::result::Result<(), EnqueueError> {
        if self.closed {
            return Err(EnqueueError {
                buffer,
                error: QueueError::Closed,
            });
        }
        if buffer.is_empty() {
            let id = buffer.id();
            return Err(EnqueueError {
                buffer,
                error: QueueError::EmptyBuffer { id },
            });
        }

        let attempt = {
            let mut enqueues = lock(&self.shared.enqueues);
            *enqueues += 1;
            *enqueues
        };
        if lock(&self.device.config).fail_enqueue_at == Some(attempt) {
            warn!("Simulated enqueue failure at attempt {}", attempt);
            return Err(EnqueueError {
                buffer,
                error: QueueError::Rejected(format!("injected failure at enqueue {}", attempt)),
            });
        }

        let size = buffer.valid_bytes();
        let depth = {
            let mut queue = lock(&self.shared.queue);
            if queue.len() >= self.shared.capacity {
                return Err(EnqueueError {
                    buffer,
                    error: QueueError::Full {
                        capacity: self.shared.capacity,
                    },
                });
            }
            queue.push_back(buffer);
            queue.len()
        };

        let mut record = lock(&self.device.record);
        record.enqueued_sizes.push(size);
        record.max_queued = record.max_queued.max(depth);
        Ok(())
    }

    fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(clock) = self.clock.take() {
            let _ = clock.shutdown_tx.send(());
            let _ = clock.handle.join();
        }

        let discarded = {
            let mut queue = lock(&self.shared.queue);
            let n = queue.len();
            queue.clear();
            n
        };

        {
            let mut active = lock(&self.device.active);
            if active
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &self.shared))
            {
                *active = None;
            }
        }
        lock(&self.device.record).close_calls += 1;
        debug!("Simulated session closed ({} buffers discarded)", discarded);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::buffer_pool::BufferPool;
    use std::sync::atomic::AtomicUsize;

    fn request(format: PcmFormat, completed: Arc<AtomicUsize>) -> SessionRequest {
        SessionRequest {
            format,
            queue_depth: 2,
            on_complete: Arc::new(move |_buffer: AudioBuffer| {
                completed.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Arc::new(|_reason: String| {}),
        }
    }

    fn filled(pool: &BufferPool, bytes: &[u8]) -> AudioBuffer {
        let mut buffer = pool.acquire_free().unwrap();
        buffer.storage_mut()[..bytes.len()].copy_from_slice(bytes);
        buffer.set_valid_bytes(bytes.len());
        buffer
    }

    #[test]
    fn test_manual_completion_order_and_record() {
        let device = SimulatedDevice::manual();
        let completed = Arc::new(AtomicUsize::new(0));
        let mut session = device
            .open(request(PcmFormat::CD_QUALITY, Arc::clone(&completed)))
            .unwrap();
        let pool = BufferPool::new(2, 4).unwrap();

        session.enqueue(filled(&pool, &[1, 2, 3, 4])).unwrap();
        session.enqueue(filled(&pool, &[5, 6])).unwrap();
        session.start().unwrap();
        assert_eq!(device.queued(), 2);

        assert!(device.complete_next());
        assert!(device.complete_next());
        assert!(!device.complete_next());
        assert_eq!(completed.load(Ordering::SeqCst), 2);

        let record = device.record();
        assert_eq!(record.played, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(record.enqueued_sizes, vec![4, 2]);
        assert_eq!(record.max_queued, 2);
    }

    #[test]
    fn test_queue_full_returns_buffer() {
        let device = SimulatedDevice::manual();
        let mut session = device
            .open(request(PcmFormat::CD_QUALITY, Arc::new(AtomicUsize::new(0))))
            .unwrap();
        let pool = BufferPool::new(3, 4).unwrap();

        session.enqueue(filled(&pool, &[1])).unwrap();
        session.enqueue(filled(&pool, &[2])).unwrap();
        let err = session.enqueue(filled(&pool, &[3])).unwrap_err();
        assert_eq!(err.error, QueueError::Full { capacity: 2 });
        assert_eq!(err.buffer.valid_data(), &[3]);
    }

    #[test]
    fn test_unsupported_format_rejected_at_open() {
        let device = SimulatedDevice::manual().with_supported_formats(vec![PcmFormat::CD_QUALITY]);
        let mono = PcmFormat::new(22050, 1, 8, pcmq_common::SampleEncoding::Unsigned).unwrap();
        let result = device.open(request(mono, Arc::new(AtomicUsize::new(0))));
        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
        assert!(!device.is_open());
    }

    #[test]
    fn test_close_is_idempotent_and_frees_device() {
        let device = SimulatedDevice::manual();
        let mut session = device
            .open(request(PcmFormat::CD_QUALITY, Arc::new(AtomicUsize::new(0))))
            .unwrap();
        assert!(device.is_open());

        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(!device.is_open());
        drop(session);
        assert_eq!(device.record().close_calls, 1);
    }

    #[test]
    fn test_timed_clock_completes_buffers() {
        let device = SimulatedDevice::timed(1000.0);
        let completed = Arc::new(AtomicUsize::new(0));
        let mut session = device
            .open(request(PcmFormat::CD_QUALITY, Arc::clone(&completed)))
            .unwrap();
        let pool = BufferPool::new(2, 64).unwrap();

        session.enqueue(filled(&pool, &[0; 64])).unwrap();
        session.enqueue(filled(&pool, &[0; 64])).unwrap();
        session.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while completed.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        session.close();
    }
}
