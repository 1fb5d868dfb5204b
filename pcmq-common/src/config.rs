//! Bootstrap configuration loading
//!
//! Configuration is a single TOML file with two sections:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [playback]
//! device = "default"
//! buffer_count = 2
//! buffer_frames = 4410
//! sample_rate = 44100
//! channels = 2
//! bits_per_sample = 16
//! encoding = "signed"
//! ```
//!
//! # Resolution order
//!
//! 1. Explicit path (command-line `--config`); must exist
//! 2. User config directory: `<config_dir>/pcmq/config.toml`
//! 3. Compiled defaults
//!
//! A missing default file is not an error: the player logs a warning and
//! starts with compiled defaults. Command-line flags are applied on top of the
//! loaded values by the binary.

use crate::sample::SampleEncoding;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the per-user configuration directory
const CONFIG_DIR_NAME: &str = "pcmq";

/// Name of the configuration file inside the configuration directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Playback configuration (optional)
    #[serde(default)]
    pub playback: PlaybackSection,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    ///
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Playback configuration: output device, buffer queue geometry and PCM format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaybackSection {
    /// Output device name (None = system default device)
    #[serde(default)]
    pub device: Option<String>,

    /// Number of buffers in the pool (also the device queue depth)
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// Capacity of each buffer in frames
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: usize,

    /// Sample rate of the raw stream in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Channel count of the raw stream
    #[serde(default = "default_channels")]
    pub channels: u8,

    /// Bits per sample of the raw stream
    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u8,

    /// Sample encoding of the raw stream
    #[serde(default)]
    pub encoding: SampleEncoding,
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            device: None,
            buffer_count: default_buffer_count(),
            buffer_frames: default_buffer_frames(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bits_per_sample: default_bits_per_sample(),
            encoding: SampleEncoding::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_buffer_count() -> usize {
    2
}

fn default_buffer_frames() -> usize {
    4410 // 100ms @ 44.1kHz
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_channels() -> u8 {
    2
}

fn default_bits_per_sample() -> u8 {
    16
}

/// Where the active configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Loaded from a TOML file
    File(PathBuf),
    /// No file found; compiled defaults in use
    Defaults,
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml_str(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve and load configuration
    ///
    /// An explicit path must exist. Without one, the per-user default file is
    /// used when present, otherwise compiled defaults are returned.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, ConfigSource)> {
        if let Some(path) = explicit {
            let config = Self::load_from(path)?;
            info!("Using configuration file {}", path.display());
            return Ok((config, ConfigSource::File(path.to_path_buf())));
        }

        match default_config_path() {
            Some(path) if path.exists() => {
                let config = Self::load_from(&path)?;
                info!("Using configuration file {}", path.display());
                Ok((config, ConfigSource::File(path)))
            }
            Some(path) => {
                warn!(
                    "No configuration file at {}; using compiled defaults",
                    path.display()
                );
                Ok((Self::default(), ConfigSource::Defaults))
            }
            None => {
                warn!("Could not determine config directory; using compiled defaults");
                Ok((Self::default(), ConfigSource::Defaults))
            }
        }
    }
}

/// Default per-user configuration file path for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TomlConfig::from_toml_str("").unwrap();
        assert_eq!(config, TomlConfig::default());
        assert_eq!(config.playback.buffer_count, 2);
        assert_eq!(config.playback.sample_rate, 44100);
        assert_eq!(config.playback.encoding, SampleEncoding::Signed);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_playback_section() {
        let config = TomlConfig::from_toml_str(
            r#"
            [playback]
            buffer_count = 4
            encoding = "float"
            bits_per_sample = 32
            "#,
        )
        .unwrap();

        assert_eq!(config.playback.buffer_count, 4);
        assert_eq!(config.playback.bits_per_sample, 32);
        assert_eq!(config.playback.encoding, SampleEncoding::Float);
        // Untouched fields keep defaults
        assert_eq!(config.playback.channels, 2);
        assert_eq!(config.playback.buffer_frames, 4410);
        assert!(config.playback.device.is_none());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = TomlConfig::from_toml_str(
            r#"
            [playback]
            buffer_cout = 4
            "#,
        );
        assert!(result.is_err());
    }
}
