//! Driving sessions on a manual simulated device

use pcmq_ap::audio::PcmFormat;
use pcmq_ap::{PlaybackController, PlayerConfig, SimulatedDevice};
use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` every millisecond until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Complete buffers one by one until the controller stops playing
///
/// Waits for the feeder to refill between completions. Returns false on
/// timeout.
pub fn drain_manual(
    device: &SimulatedDevice,
    controller: &PlaybackController,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while controller.is_playing() {
        if Instant::now() > deadline {
            return false;
        }
        if !device.complete_next() {
            thread::sleep(Duration::from_millis(1));
        }
    }
    true
}

/// CD-format config with `buffer_count` buffers of `buffer_frames` frames
pub fn small_config(buffer_count: usize, buffer_frames: usize) -> PlayerConfig {
    PlayerConfig {
        buffer_count,
        buffer_frames,
        format: PcmFormat::CD_QUALITY,
        ..PlayerConfig::default()
    }
}
