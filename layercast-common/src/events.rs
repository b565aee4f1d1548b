//! Event types for the layercast event system
//!
//! The Progress Registry publishes every snapshot replace on the [`EventBus`];
//! pollers that prefer push delivery subscribe instead of calling
//! `get_progress` in a loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Generation session status
///
/// PENDING → GENERATING → UPLOADING → COMPLETED, with ERROR reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GenerationStatus {
    /// Configured, waiting for start-generation
    Pending,
    /// Computing combinations, compositing and uploading artifacts
    Generating,
    /// Uploading the collection metadata document
    Uploading,
    /// Finished successfully
    Completed,
    /// Failed; terminal, never auto-retried
    Error,
}

impl GenerationStatus {
    /// COMPLETED and ERROR accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationStatus::Completed | GenerationStatus::Error)
    }

    /// Whether a generation run currently owns the session
    pub fn is_running(self) -> bool {
        matches!(self, GenerationStatus::Generating | GenerationStatus::Uploading)
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GenerationStatus::Pending => "PENDING",
            GenerationStatus::Generating => "GENERATING",
            GenerationStatus::Uploading => "UPLOADING",
            GenerationStatus::Completed => "COMPLETED",
            GenerationStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Latest progress record for one session
///
/// Always replaced as a whole; no history is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    pub status: GenerationStatus,
    /// Percentage complete (0.0 - 100.0)
    pub percentage: f64,
    /// Items composited and uploaded so far
    pub current: usize,
    /// Target supply
    pub total: usize,
    /// Human-readable description of the current step
    pub message: String,
    /// Error message when status is ERROR
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Initial snapshot for a freshly configured session
    pub fn pending(session_id: Uuid, total: usize) -> Self {
        Self {
            session_id,
            status: GenerationStatus::Pending,
            percentage: 0.0,
            current: 0,
            total,
            message: "Waiting to start".to_string(),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Layercast event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GenerationEvent {
    /// Layers uploaded, session created
    SessionCreated {
        session_id: Uuid,
        layer_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Configuration accepted
    SessionConfigured {
        session_id: Uuid,
        target_supply: usize,
        timestamp: DateTime<Utc>,
    },

    /// Generation run started (session entered GENERATING)
    GenerationStarted {
        session_id: Uuid,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// Progress snapshot replaced
    ProgressUpdated { snapshot: ProgressSnapshot },

    /// Generation run finished successfully
    GenerationCompleted {
        session_id: Uuid,
        total_supply: usize,
        metadata_uri: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Generation run failed
    GenerationFailed {
        session_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Session state removed (explicit cleanup or TTL eviction)
    SessionRemoved {
        session_id: Uuid,
        expired: bool,
        timestamp: DateTime<Utc>,
    },
}

impl GenerationEvent {
    /// Session this event belongs to
    pub fn session_id(&self) -> Uuid {
        match self {
            GenerationEvent::SessionCreated { session_id, .. }
            | GenerationEvent::SessionConfigured { session_id, .. }
            | GenerationEvent::GenerationStarted { session_id, .. }
            | GenerationEvent::GenerationCompleted { session_id, .. }
            | GenerationEvent::GenerationFailed { session_id, .. }
            | GenerationEvent::SessionRemoved { session_id, .. } => *session_id,
            GenerationEvent::ProgressUpdated { snapshot } => snapshot.session_id,
        }
    }
}

/// Broadcast bus for [`GenerationEvent`]s
///
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GenerationEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    ///
    /// ```
    /// use layercast_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: GenerationEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
