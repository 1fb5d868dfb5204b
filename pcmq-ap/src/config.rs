//! pcmq-ap player configuration
//!
//! Built from the TOML bootstrap file (see `pcmq_common::config`) with
//! command-line overrides applied on top:
//!
//! 1. Command-line arguments (`--buffers`, `--sample-rate`, ...)
//! 2. TOML configuration file
//! 3. Built-in defaults

use crate::audio::format::PcmFormat;
use crate::error::{Error, Result};
use crate::playback::engine::SessionParams;
use pcmq_common::config::{ConfigSource, TomlConfig};
use pcmq_common::SampleEncoding;
use std::path::Path;

/// Values given on the command line; `None` keeps the file value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub device: Option<String>,
    pub buffer_count: Option<usize>,
    pub buffer_frames: Option<usize>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bits_per_sample: Option<u8>,
    pub encoding: Option<SampleEncoding>,
}

/// Validated player configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    /// Output device name (None = default device)
    pub device: Option<String>,
    pub buffer_count: usize,
    pub buffer_frames: usize,
    pub format: PcmFormat,
    pub log_level: String,
}

impl PlayerConfig {
    /// Load the bootstrap file and apply overrides
    ///
    /// An explicit path must exist; otherwise the per-user file is used if
    /// present, else compiled defaults.
    pub fn load(
        explicit: Option<&Path>,
        overrides: &ConfigOverrides,
    ) -> Result<(Self, ConfigSource)> {
        let (file, source) = TomlConfig::resolve(explicit)?;
        Ok((Self::resolve(&file, overrides)?, source))
    }

    /// Merge file values and overrides, then validate
    pub fn resolve(file: &TomlConfig, overrides: &ConfigOverrides) -> Result<Self> {
        let playback = &file.playback;

        let format = PcmFormat::new(
            overrides.sample_rate.unwrap_or(playback.sample_rate),
            overrides.channels.unwrap_or(playback.channels),
            overrides.bits_per_sample.unwrap_or(playback.bits_per_sample),
            overrides.encoding.unwrap_or(playback.encoding),
        )
        .map_err(|e| Error::Config(format!("Invalid stream format: {}", e)))?;

        let config = Self {
            device: overrides.device.clone().or_else(|| playback.device.clone()),
            buffer_count: overrides.buffer_count.unwrap_or(playback.buffer_count),
            buffer_frames: overrides.buffer_frames.unwrap_or(playback.buffer_frames),
            format,
            log_level: file.logging.level.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.session_params().validate()
    }

    /// Buffer geometry and format for a session in the configured format
    pub fn session_params(&self) -> SessionParams {
        self.session_params_for(self.format)
    }

    /// Buffer geometry for a session in `format`
    pub fn session_params_for(&self, format: PcmFormat) -> SessionParams {
        SessionParams {
            format,
            buffer_count: self.buffer_count,
            buffer_frames: self.buffer_frames,
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let file = TomlConfig::default();
        Self {
            device: file.playback.device,
            buffer_count: file.playback.buffer_count,
            buffer_frames: file.playback.buffer_frames,
            format: PcmFormat::CD_QUALITY,
            log_level: file.logging.level,
        }
    }
}
