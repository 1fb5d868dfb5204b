//! Event types for the pcmq event system
//!
//! Provides the session state enumeration, the player event enum and the
//! broadcast EventBus used to report asynchronous playback outcomes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifecycle state of one playback session
///
/// ```text
/// Idle → Priming → Playing → Draining → Stopped
///           │         │
///           └─────────┴──→ Failed
/// ```
///
/// `stop()` moves any non-terminal state to Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[repr(u8)]
pub enum SessionState {
    /// Created, device not opened yet
    Idle = 0,
    /// Device open, initial buffers being filled and enqueued
    Priming = 1,
    /// Steady state: completions trigger refills
    Playing = 2,
    /// End of stream reached, queued audio still playing
    Draining = 3,
    /// Finished or cancelled; device closed
    Stopped = 4,
    /// Terminated by an error; device closed
    Failed = 5,
}

impl SessionState {
    /// Decode a state previously stored with `as u8`
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SessionState::Idle),
            1 => Some(SessionState::Priming),
            2 => Some(SessionState::Playing),
            3 => Some(SessionState::Draining),
            4 => Some(SessionState::Stopped),
            5 => Some(SessionState::Failed),
            _ => None,
        }
    }

    /// True while audio is (or is about to be) produced
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Priming | SessionState::Playing | SessionState::Draining
        )
    }

    /// True once the session can no longer change state
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Priming => write!(f, "Priming"),
            SessionState::Playing => write!(f, "Playing"),
            SessionState::Draining => write!(f, "Draining"),
            SessionState::Stopped => write!(f, "Stopped"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Player event types
///
/// Events are broadcast via EventBus and can be serialized (e.g. for JSON logs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// A session was created for a source file
    SessionStarted {
        /// Session identifier
        session_id: Uuid,
        /// Source file path
        path: String,
        /// Human-readable PCM format description
        format: String,
        /// When the session started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Session state transition
    StateChanged {
        /// Session identifier
        session_id: Uuid,
        /// State before transition
        old_state: SessionState,
        /// State after transition
        new_state: SessionState,
        /// When the transition happened
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// All queued audio finished playing after end of stream
    PlaybackCompleted {
        /// Session identifier
        session_id: Uuid,
        /// Total bytes the device consumed
        bytes_played: u64,
        /// When playback completed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback cancelled by the caller
    PlaybackStopped {
        /// Session identifier
        session_id: Uuid,
        /// When playback stopped
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback terminated by an error while running
    PlaybackFailed {
        /// Session identifier
        session_id: Uuid,
        /// Error description
        reason: String,
        /// When the failure was detected
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PlayerEvent {
    /// Session this event belongs to
    pub fn session_id(&self) -> Uuid {
        match self {
            PlayerEvent::SessionStarted { session_id, .. }
            | PlayerEvent::StateChanged { session_id, .. }
            | PlayerEvent::PlaybackCompleted { session_id, .. }
            | PlayerEvent::PlaybackStopped { session_id, .. }
            | PlayerEvent::PlaybackFailed { session_id, .. } => *session_id,
        }
    }

    /// True for events after which the session emits nothing more
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PlayerEvent::PlaybackCompleted { .. }
                | PlayerEvent::PlaybackStopped { .. }
                | PlayerEvent::PlaybackFailed { .. }
        )
    }
}

/// Broadcast bus for player events
///
/// `emit` never blocks, so it may be called from the feeder thread.
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PlayerEvent,
    ) -> Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
