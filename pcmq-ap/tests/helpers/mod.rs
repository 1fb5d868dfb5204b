//! Test helper modules for pcmq-ap integration tests
//!
//! - pcm_fixture: temporary raw PCM files with a recognisable byte pattern
//! - session_driver: drive a manual simulated device until playback ends

#![allow(dead_code)]

pub mod pcm_fixture;
pub mod session_driver;

pub use pcm_fixture::PcmFixture;
pub use session_driver::{drain_manual, small_config, wait_until};
