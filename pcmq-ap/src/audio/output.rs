//! Audio output using cpal
//!
//! Implements [`AudioDevice`] on top of a cpal output stream.
//!
//! **Architecture:** a dedicated output thread owns the cpal `Stream` (cpal
//! streams are not `Send` on every platform). The session talks to it through
//! a command channel. Queued buffers travel to the data callback through a
//! lock-free SPSC ring whose capacity is the session's queue depth, so the
//! callback never locks or allocates while audio is flowing.
//!
//! The raw byte stream is copied into the device buffer unchanged: the stream
//! is opened with the exact sample format, channel count and rate of the PCM
//! source, and opening fails with `UnsupportedFormat` if the device cannot
//! accept that natively.

use crate::audio::device::{
    AudioDevice, CompletionHandler, DeviceErrorHandler, DeviceSession, EnqueueError, QueueError,
    SessionRequest,
};
use crate::audio::format::PcmFormat;
use crate::error::{Error, Result};
use crate::playback::buffer_pool::AudioBuffer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use crossbeam::channel::{bounded, Receiver, Sender};
use pcmq_common::SampleEncoding;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Output device backed by the platform audio host
#[derive(Debug, Clone, Default)]
pub struct CpalDevice {
    /// Requested device name (None = default device)
    device_name: Option<String>,
}

impl CpalDevice {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    /// List available audio output devices.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();

        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::Device(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();

        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }
}

impl AudioDevice for CpalDevice {
    fn describe(&self) -> String {
        match &self.device_name {
            Some(name) => format!("cpal:{}", name),
            None => "cpal:default".to_string(),
        }
    }

    fn open(&self, request: SessionRequest) -> Result<Box<dyn DeviceSession>> {
        let sample_format = native_sample_format(&request.format)?;

        let ring = HeapRb::<AudioBuffer>::new(request.queue_depth);
        let (producer, consumer) = ring.split();

        let shared = Arc::new(OutputShared::default());
        let (command_tx, command_rx) = bounded::<OutputCommand>(4);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let thread_shared = Arc::clone(&shared);
        let device_name = self.device_name.clone();
        let SessionRequest {
            format,
            queue_depth,
            on_complete,
            on_error,
        } = request;
        let drain = QueueDrain::new(
            consumer,
            on_complete,
            Arc::clone(&shared),
            &format,
            queue_depth,
        );

        let handle = thread::Builder::new()
            .name("pcmq-output".to_string())
            .spawn(move || {
                output_thread_run(OutputThreadArgs {
                    device_name,
                    format,
                    sample_format,
                    drain,
                    on_error,
                    shared: thread_shared,
                    ready_tx,
                    command_rx,
                })
            })
            .map_err(|e| Error::Device(format!("Failed to spawn output thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::Device(
                    "Output thread exited before the stream was ready".to_string(),
                ));
            }
        }

        Ok(Box::new(CpalSession {
            producer,
            command_tx,
            thread: Some(handle),
            shared,
            capacity: queue_depth,
            closed: false,
        }))
    }
}

/// Map a PCM format onto the cpal sample format with the same byte layout
fn native_sample_format(format: &PcmFormat) -> Result<SampleFormat> {
    if cfg!(target_endian = "big") {
        return Err(Error::UnsupportedFormat(
            "little-endian PCM cannot be passed through on a big-endian host".to_string(),
        ));
    }

    let sample_format = match (format.encoding, format.bits_per_sample) {
        (SampleEncoding::Signed, 8) => SampleFormat::I8,
        (SampleEncoding::Unsigned, 8) => SampleFormat::U8,
        (SampleEncoding::Signed, 16) => SampleFormat::I16,
        (SampleEncoding::Unsigned, 16) => SampleFormat::U16,
        (SampleEncoding::Signed, 32) => SampleFormat::I32,
        (SampleEncoding::Unsigned, 32) => SampleFormat::U32,
        (SampleEncoding::Float, 32) => SampleFormat::F32,
        _ => {
            return Err(Error::UnsupportedFormat(format!(
                "{} has no native output sample format",
                format
            )))
        }
    };
    Ok(sample_format)
}

/// Byte pattern of one silent sample
fn silence_pattern(format: &PcmFormat) -> [u8; 4] {
    match (format.encoding, format.bits_per_sample) {
        (SampleEncoding::Unsigned, 8) => [0x80, 0, 0, 0],
        (SampleEncoding::Unsigned, 16) => [0x00, 0x80, 0, 0],
        (SampleEncoding::Unsigned, 32) => [0, 0, 0, 0x80],
        _ => [0; 4],
    }
}

/// Find the requested device, falling back to the default output device
fn select_device(host: &cpal::Host, device_name: Option<&str>) -> Result<Device> {
    if let Some(name) = device_name {
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::Device(format!("Failed to enumerate devices: {}", e)))?;

        if let Some(dev) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            info!("Found requested audio device: {}", name);
            return Ok(dev);
        }

        warn!(
            "Requested device '{}' not found, falling back to default device",
            name
        );
    }

    let dev = host
        .default_output_device()
        .ok_or_else(|| Error::Device("No default output device found".to_string()))?;
    info!(
        "Using default audio device: {}",
        dev.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    Ok(dev)
}

/// Find a device configuration that plays `format` without conversion
fn exact_config(
    device: &Device,
    format: &PcmFormat,
    sample_format: SampleFormat,
) -> Result<StreamConfig> {
    let rate = cpal::SampleRate(format.sample_rate_hz);
    let channels = u16::from(format.channels);

    let mut supported_configs = device
        .supported_output_configs()
        .map_err(|e| Error::Device(format!("Failed to get device configs: {}", e)))?;

    let matching = supported_configs.find(|config| {
        config.channels() == channels
            && config.sample_format() == sample_format
            && config.min_sample_rate() <= rate
            && config.max_sample_rate() >= rate
    });

    match matching {
        Some(supported) => Ok(supported.with_sample_rate(rate).config()),
        None => Err(Error::UnsupportedFormat(format!(
            "device '{}' cannot play {} natively",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            format
        ))),
    }
}

/// State shared between the session handle and the data callback
#[derive(Default)]
struct OutputShared {
    /// Buffers pushed into the ring and not yet completed
    queued: AtomicUsize,
    /// Callbacks that ran out of queued audio
    underruns: AtomicU64,
    /// Set once the stream is playing
    started: AtomicBool,
}

enum OutputCommand {
    Play(Sender<Result<()>>),
    Shutdown,
}

struct OutputThreadArgs {
    device_name: Option<String>,
    format: PcmFormat,
    sample_format: SampleFormat,
    drain: QueueDrain,
    on_error: DeviceErrorHandler,
    shared: Arc<OutputShared>,
    ready_tx: Sender<Result<()>>,
    command_rx: Receiver<OutputCommand>,
}

/// Output thread main loop; owns the cpal stream for the session lifetime
fn output_thread_run(args: OutputThreadArgs) {
    let OutputThreadArgs {
        device_name,
        format,
        sample_format,
        mut drain,
        on_error,
        shared,
        ready_tx,
        command_rx,
    } = args;

    let host = cpal::default_host();
    let built = select_device(&host, device_name.as_deref()).and_then(|device| {
        let config = exact_config(&device, &format, sample_format)?;
        debug!(
            "Opening output stream: sample_rate={}, channels={}, format={:?}",
            config.sample_rate.0, config.channels, sample_format
        );

        device
            .build_output_stream_raw(
                &config,
                sample_format,
                move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
                    drain.render(data.bytes_mut());
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    on_error(err.to_string());
                },
                None,
            )
            .map_err(|e| Error::Device(format!("Failed to build output stream: {}", e)))
    });

    let stream = match built {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if ready_tx.send(Ok(())).is_err() {
        return;
    }

    while let Ok(cmd) = command_rx.recv() {
        match cmd {
            OutputCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| Error::Device(format!("Failed to start stream: {}", e)));
                if result.is_ok() {
                    shared.started.store(true, Ordering::Release);
                    info!("Audio stream started");
                }
                let _ = reply.send(result);
            }
            OutputCommand::Shutdown => break,
        }
    }

    // Dropping the stream stops callbacks; pending buffers drop with the ring
    drop(stream);
    debug!("Output thread exiting");
}

/// Data callback state: copies queued buffers into the device buffer
///
/// A buffer whose last bytes went into a period completes at the start of
/// the next callback, once the host has taken that period.
struct QueueDrain {
    consumer: HeapCons<AudioBuffer>,
    current: Option<(AudioBuffer, usize)>,
    /// Fully copied, awaiting completion; never grows past the queue depth
    played: Vec<AudioBuffer>,
    on_complete: CompletionHandler,
    shared: Arc<OutputShared>,
    silence: [u8; 4],
    bytes_per_sample: usize,
}

impl QueueDrain {
    fn new(
        consumer: HeapCons<AudioBuffer>,
        on_complete: CompletionHandler,
        shared: Arc<OutputShared>,
        format: &PcmFormat,
        queue_depth: usize,
    ) -> Self {
        Self {
            consumer,
            current: None,
            played: Vec::with_capacity(queue_depth),
            on_complete,
            shared,
            silence: silence_pattern(format),
            bytes_per_sample: format.bytes_per_sample(),
        }
    }

    fn render(&mut self, out: &mut [u8]) {
        for done in self.played.drain(..) {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            (self.on_complete)(done);
        }

        let mut written = 0;

        while written < out.len() {
            if self.current.is_none() {
                self.current = self.consumer.try_pop().map(|buffer| (buffer, 0));
            }
            let Some((buffer, offset)) = self.current.as_mut() else {
                break;
            };

            let pending = &buffer.valid_data()[*offset..];
            let n = pending.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&pending[..n]);
            written += n;
            *offset += n;

            if *offset >= buffer.valid_bytes() {
                if let Some((done, _)) = self.current.take() {
                    self.played.push(done);
                }
            }
        }

        if written < out.len() {
            for (i, byte) in out[written..].iter_mut().enumerate() {
                *byte = self.silence[(written + i) % self.bytes_per_sample];
            }
            if self.shared.started.load(Ordering::Acquire) {
                self.shared.underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Open cpal session
struct CpalSession {
    producer: HeapProd<AudioBuffer>,
    command_tx: Sender<OutputCommand>,
    thread: Option<JoinHandle<()>>,
    shared: Arc<OutputShared>,
    capacity: usize,
    closed: bool,
}

impl DeviceSession for CpalSession {
    fn start(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Device("Session already closed".to_string()));
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.command_tx
            .send(OutputCommand::Play(reply_tx))
            .map_err(|_| Error::Device("Output thread not running".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Device("Output thread exited during start".to_string()))?
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

        // Count first: the callback may complete the buffer before try_push returns
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(buffer) = self.producer.try_push(buffer) {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(EnqueueError {
                buffer,
                error: QueueError::Full {
                    capacity: self.capacity,
                },
            });
        }
        Ok(())
    }

    fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.command_tx.send(OutputCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Output thread panicked");
            }
        }

        let discarded = self.producer.occupied_len();
        self.shared.queued.store(0, Ordering::Release);
        debug!("Output session closed ({} buffers discarded)", discarded);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }
}

impl Drop for CpalSession {
    fn drop(&mut self) {
        self.close();
    }
}
