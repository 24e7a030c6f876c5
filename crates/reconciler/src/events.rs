//! Structured status events
//!
//! Events describe state transitions for external consumers (terminal UI,
//! notifications). They are separate from diagnostic logging: a sink
//! decides where they go.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    OperationStarted,
    WaveStarted,
    HookCompleted,
    ResourceApplied,
    ResourcePruned,
    ResourceFailed,
    RetryScheduled,
    OperationTerminating,
    OperationFinished,
    /// History and status reflect the finished operation
    OperationRecorded,
    SyncStatusChanged,
    HealthStatusChanged,
    DriftDetected,
    RenderFailed,
    ApplicationRemoved,
}

impl EventKind {
    /// Whether the event reports something going wrong
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            Self::ResourceFailed | Self::RetryScheduled | Self::DriftDetected | Self::RenderFailed
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub app: String,
    pub kind: EventKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(app: impl Into<String>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.app, self.kind, self.message)
    }
}

/// Receiver of status events
///
/// Implementations must not block; they are called from worker tasks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Sink that writes events to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &Event) {
        if event.kind.is_warning() {
            log::warn!("{event}");
        } else {
            log::info!("{event}");
        }
    }
}

/// Sink that fans events out to any number of subscribers
///
/// Slow subscribers lose the oldest events rather than slowing workers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<Event>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &Event) {
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

impl<A: EventSink, B: EventSink> EventSink for (A, B) {
    fn emit(&self, event: &Event) {
        self.0.emit(event);
        self.1.emit(event);
    }
}
