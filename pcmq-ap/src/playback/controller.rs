//! Playback controller
//!
//! The single entry point callers use: `start(path)`, `stop()`,
//! `is_playing()`, plus progress and status queries. At most one session
//! exists at a time. Starting while a session is priming, playing or draining
//! fails with `AlreadyPlaying`; a finished or failed session is reaped by the
//! next `start`.

use crate::audio::device::AudioDevice;
use crate::audio::format::PcmFormat;
use crate::audio::output::CpalDevice;
use crate::config::PlayerConfig;
use crate::error::{Error, Result};
use crate::playback::engine::{PlaybackSession, PlaybackStats};
use crate::playback::lock_unpoisoned;
use crate::runtime;
use pcmq_common::{EventBus, PlayerEvent, SessionState};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Playback façade over one output device
pub struct PlaybackController {
    device: Arc<dyn AudioDevice>,
    config: PlayerConfig,
    events: Arc<EventBus>,
    session: Mutex<Option<PlaybackSession>>,
}

impl PlaybackController {
    /// Create a controller for `device`
    ///
    /// # Errors
    /// `Config` if the buffer geometry or format is invalid.
    pub fn new(device: Arc<dyn AudioDevice>, config: PlayerConfig) -> Result<Self> {
        config.validate()?;
        runtime::initialize();
        Ok(Self {
            device,
            config,
            events: Arc::new(EventBus::default()),
            session: Mutex::new(None),
        })
    }

    /// Create a controller on the configured cpal output device
    pub fn with_default_output(config: PlayerConfig) -> Result<Self> {
        let device = Arc::new(CpalDevice::new(config.device.clone()));
        Self::new(device, config)
    }

    /// Start playing `path` in the configured format
    ///
    /// Returns the new session id once priming succeeded.
    ///
    /// # Errors
    /// `NotFound`, `UnsupportedFormat`, `Io`, `Device`, `Queue`, `AlreadyPlaying`
    pub fn start(&self, path: impl AsRef<Path>) -> Result<Uuid> {
        self.start_with_format(path, self.config.format)
    }

    /// Start playing `path` as a stream in `format`
    pub fn start_with_format(&self, path: impl AsRef<Path>, format: PcmFormat) -> Result<Uuid> {
        let mut slot = lock_unpoisoned(&self.session);

        if let Some(current) = slot.as_ref() {
            if current.state().is_active() {
                return Err(Error::AlreadyPlaying(current.id()));
            }
        }

        if let Some(mut finished) = slot.take() {
            debug!(
                "Reaping session {} ({})",
                finished.id(),
                finished.state()
            );
            finished.stop();
        }

        let session = PlaybackSession::start(
            self.device.as_ref(),
            path,
            self.config.session_params_for(format),
            Arc::clone(&self.events),
        )?;
        let id = session.id();
        *slot = Some(session);
        Ok(id)
    }

    /// Stop the current session, if any; idempotent
    ///
    /// The stopped session stays available for `stats()` and `state()`.
    pub fn stop(&self) {
        if let Some(session) = lock_unpoisoned(&self.session).as_mut() {
            if session.state().is_active() {
                info!("Stopping session {}", session.id());
            }
            session.stop();
        }
    }

    /// True while a session is priming, playing or draining
    pub fn is_playing(&self) -> bool {
        self.state().is_active()
    }

    /// State of the current session (`Idle` before the first start)
    pub fn state(&self) -> SessionState {
        self.with_session(|s| s.state()).unwrap_or(SessionState::Idle)
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.with_session(|s| s.id())
    }

    /// Duration of audio played in the current session
    pub fn position(&self) -> Duration {
        self.with_session(|s| s.position()).unwrap_or_default()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.with_session(|s| s.stats()).unwrap_or_default()
    }

    /// Failure reason of the current session
    pub fn last_error(&self) -> Option<String> {
        self.with_session(|s| s.last_error()).flatten()
    }

    /// Receive events of every future session
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Block until the current session has ended
    ///
    /// Returns true immediately when nothing is playing, false if `timeout`
    /// elapsed first. Does not hold the controller lock while waiting, so
    /// `stop()` from another thread ends the wait.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let waiter = self.with_session(|s| s.finish_waiter());
        match waiter {
            Some(waiter) => waiter.wait(timeout),
            None => true,
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    fn with_session<T>(&self, f: impl FnOnce(&PlaybackSession) -> T) -> Option<T> {
        lock_unpoisoned(&self.session).as_ref().map(f)
    }
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("device", &self.device.describe())
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
