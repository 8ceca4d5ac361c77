//! Output events and the publish/subscribe boundary.
//!
//! Every byte a backend produces leaves the core as an [`OutputEvent`]
//! pushed through an [`OutputSink`]. The sink is fire-and-forget: the core
//! never depends on delivery confirmation or subscriber presence.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::SessionId;

/// Classification of an output event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Regular output (stdout or the remote channel's data stream).
    Output,
    /// Error-stream output or an operational error report.
    Error,
    /// Backend terminated; always the last event for a session.
    Exit,
    /// Session status change (connected, error, disconnected).
    Status,
}

/// An immutable record published outward for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Event classification.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Text payload; may be empty for status/exit events.
    pub data: String,
    /// Milliseconds since the Unix epoch at publish time.
    pub timestamp_ms: u64,
    /// Exit code, present only for `Exit` events and only when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl OutputEvent {
    /// Regular output chunk.
    pub fn output(data: impl Into<String>) -> Self {
        Self::new(EventKind::Output, data.into(), None)
    }

    /// Error-stream chunk or operational error report.
    pub fn error(data: impl Into<String>) -> Self {
        Self::new(EventKind::Error, data.into(), None)
    }

    /// Backend exit notification.
    pub fn exit(exit_code: Option<i32>) -> Self {
        Self::new(EventKind::Exit, String::new(), exit_code)
    }

    /// Session status change notification.
    pub fn status(status: impl Into<String>) -> Self {
        Self::new(EventKind::Status, status.into(), None)
    }

    fn new(kind: EventKind, data: String, exit_code: Option<i32>) -> Self {
        Self {
            kind,
            data,
            timestamp_ms: now_ms(),
            exit_code,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The external publish/subscribe boundary.
///
/// Implementations bridge to whatever transport delivers events to UI
/// clients. `publish` must not block and must not fail visibly; dropped
/// events are the subscriber's problem, not the core's.
pub trait OutputSink: Send + Sync {
    /// Push one event onto the given topic (`session/{sessionId}`).
    fn publish(&self, topic: &str, event: OutputEvent);
}

/// Broadcast-channel sink for tests and in-process embedders.
///
/// All topics share one channel; receivers filter on the topic they care
/// about. Lagging receivers lose the oldest events, matching the
/// fire-and-forget contract.
pub struct BroadcastSink {
    tx: broadcast::Sender<(String, OutputEvent)>,
}

impl BroadcastSink {
    /// Create a sink with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the raw `(topic, event)` stream.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, OutputEvent)> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl OutputSink for BroadcastSink {
    fn publish(&self, topic: &str, event: OutputEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send((topic.to_string(), event));
    }
}
