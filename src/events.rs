//! Session lifecycle events
//!
//! Publishes `connected` / `turn_started` / `turn_ended` / `disconnected`
//! to logging and metrics consumers. The bus is constructed once at startup
//! and passed down explicitly; publishing is best-effort and never
//! propagates errors to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffered events per subscriber
const DEFAULT_CAPACITY: usize = 64;

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Connected,
    TurnStarted,
    TurnEnded,
    Disconnected,
}

/// One lifecycle event for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl SessionEvent {
    #[must_use]
    pub fn new(kind: SessionEventKind, session_id: &str, device_id: Option<&str>) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            device_id: device_id.map(ToString::to_string),
            at: Utc::now(),
        }
    }
}

/// Broadcast bus for session lifecycle events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody is subscribed
    pub fn publish(&self, event: SessionEvent) {
        tracing::debug!(
            kind = ?event.kind,
            session_id = %event.session_id,
            "session event"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}
