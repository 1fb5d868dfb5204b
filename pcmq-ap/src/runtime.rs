//! Process-wide one-time initialisation
//!
//! `initialize()` runs before the first session is created. It is cheap to
//! call repeatedly; only the first call does any work.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::info;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static RUNTIME_INFO: OnceLock<RuntimeInfo> = OnceLock::new();

/// Facts captured when the player runtime was initialised
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub version: &'static str,
    /// Platform audio host the cpal backend uses
    pub audio_host: String,
    pub initialized_at: DateTime<Utc>,
}

/// Initialise the player runtime; idempotent
pub fn initialize() -> &'static RuntimeInfo {
    let info = RUNTIME_INFO.get_or_init(|| RuntimeInfo {
        version: env!("CARGO_PKG_VERSION"),
        audio_host: cpal::default_host().id().name().to_string(),
        initialized_at: Utc::now(),
    });

    if INITIALIZED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        info!(
            "pcmq-ap {} runtime initialized (audio host: {})",
            info.version, info.audio_host
        );
    }
    info
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}
