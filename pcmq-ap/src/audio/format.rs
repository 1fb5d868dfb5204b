//! PCM stream format
//!
//! Describes the layout of the raw (headerless) sample stream: rate, channel
//! count, depth and encoding. Samples are little-endian and interleaved.
//! The format is fixed for the lifetime of one playback session.

use crate::error::{Error, Result};
use pcmq_common::config::PlaybackSection;
use pcmq_common::SampleEncoding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Raw PCM stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub encoding: SampleEncoding,
}

impl PcmFormat {
    /// 44.1kHz stereo signed 16-bit, the stream layout the player assumes by default
    pub const CD_QUALITY: PcmFormat = PcmFormat {
        sample_rate_hz: 44100,
        channels: 2,
        bits_per_sample: 16,
        encoding: SampleEncoding::Signed,
    };

    /// Create a validated format
    pub fn new(
        sample_rate_hz: u32,
        channels: u8,
        bits_per_sample: u8,
        encoding: SampleEncoding,
    ) -> Result<Self> {
        let format = Self {
            sample_rate_hz,
            channels,
            bits_per_sample,
            encoding,
        };
        format.validate()?;
        Ok(format)
    }

    /// Build the stream format from the `[playback]` configuration section
    pub fn from_config(section: &PlaybackSection) -> Result<Self> {
        Self::new(
            section.sample_rate,
            section.channels,
            section.bits_per_sample,
            section.encoding,
        )
    }

    /// Check the structural constraints every session relies on
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(Error::UnsupportedFormat(
                "sample rate must be greater than zero".to_string(),
            ));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(Error::UnsupportedFormat(format!(
                "{} channels (only mono and stereo are supported)",
                self.channels
            )));
        }
        if !matches!(self.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(Error::UnsupportedFormat(format!(
                "{} bits per sample (expected 8, 16, 24 or 32)",
                self.bits_per_sample
            )));
        }
        if self.encoding == SampleEncoding::Float && self.bits_per_sample != 32 {
            return Err(Error::UnsupportedFormat(format!(
                "float samples must be 32-bit, got {}-bit",
                self.bits_per_sample
            )));
        }
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Bytes in one interleaved frame (one sample per channel)
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_frame() as u64 * u64::from(self.sample_rate_hz)
    }

    /// Playback duration of `bytes` bytes of audio in this format
    pub fn duration_of(&self, bytes: u64) -> Duration {
        let frames = bytes / self.bytes_per_frame() as u64;
        let rate = u64::from(self.sample_rate_hz);
        let secs = frames / rate;
        let rem_frames = frames % rate;
        Duration::from_secs(secs) + Duration::from_nanos(rem_frames * 1_000_000_000 / rate)
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::CD_QUALITY
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = match self.channels {
            1 => "mono",
            2 => "stereo",
            _ => "multichannel",
        };
        let prefix = match self.encoding {
            SampleEncoding::Signed => "s",
            SampleEncoding::Unsigned => "u",
            SampleEncoding::Float => "f",
        };
        write!(
            f,
            "{}Hz {} {}{}le",
            self.sample_rate_hz, layout, prefix, self.bits_per_sample
        )
    }
}
