//! Installation events published to telemetry and progress displays.
//!
//! Publishing never blocks and never fails from the caller's point of view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};
use uuid::Uuid;

const DEFAULT_BUFFER: usize = 256;

/// Structured event emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallEvent {
    Progress {
        installation_id: Uuid,
        step: String,
        index: usize,
        total: usize,
        percent: u8,
    },
    StepCompleted {
        installation_id: Uuid,
        step: String,
        status: String,
        attempts: u32,
        duration_ms: u64,
    },
    Security {
        installation_id: Uuid,
        code: String,
        severity: String,
        message: String,
    },
    Rollback {
        installation_id: Uuid,
        step: String,
        success: bool,
        steps_undone: usize,
        errors: usize,
    },
    Completed {
        installation_id: Uuid,
        result: String,
        exit_code: i32,
        duration_ms: u64,
    },
}

impl InstallEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::StepCompleted { .. } => "step_completed",
            Self::Security { .. } => "security",
            Self::Rollback { .. } => "rollback",
            Self::Completed { .. } => "completed",
        }
    }

    pub fn installation_id(&self) -> Uuid {
        match self {
            Self::Progress {
                installation_id, ..
            }
            | Self::StepCompleted {
                installation_id, ..
            }
            | Self::Security {
                installation_id, ..
            }
            | Self::Rollback {
                installation_id, ..
            }
            | Self::Completed {
                installation_id, ..
            } => *installation_id,
        }
    }
}

/// Fire-and-forget event consumer.
pub trait EventSink: Send + Sync {
    /// Hand over an event. Must return promptly and must not fail.
    fn publish(&self, event: InstallEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, event: InstallEvent) {
        trace!(kind = event.kind(), "Discarding event");
    }
}

/// Broadcast channel of timestamped event envelopes for local listeners.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TimedEvent>,
}

/// Event plus the time it was published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub timestamp: DateTime<Utc>,
    pub event: InstallEvent,
}

impl EventBus {
    /// The buffer is clamped to at least 256 entries.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(DEFAULT_BUFFER));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimedEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: InstallEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(TimedEvent {
            timestamp: Utc::now(),
            event,
        });
    }
}

/// Forwards each event to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: InstallEvent) {
        if self.sinks.is_empty() {
            warn!(kind = event.kind(), "Event published with no sinks attached");
            return;
        }
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn progress(step: &str) -> InstallEvent {
        InstallEvent::Progress {
            installation_id: Uuid::nil(),
            step: step.to_string(),
            index: 0,
            total: 3,
            percent: 0,
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(progress("download-package")).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["step"], "download-package");
        assert_eq!(json["total"], 3);
    }

    #[tokio::test]
    async fn test_bus_delivers_timestamped_events() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();
        bus.publish(progress("a"));

        let received = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("broadcast recv failed");
        assert_eq!(received.event, progress("a"));
        assert!(received.timestamp <= Utc::now());
    }

    #[test]
    fn test_bus_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(progress("a"));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let first = EventBus::default();
        let second = EventBus::default();
        let mut rx1 = first.subscribe();
        let mut rx2 = second.subscribe();

        let fanout = FanoutSink::new()
            .with(Arc::new(first))
            .with(Arc::new(second));
        assert_eq!(fanout.len(), 2);
        fanout.publish(progress("b"));

        assert_eq!(rx1.recv().await.unwrap().event.kind(), "progress");
        assert_eq!(rx2.recv().await.unwrap().event.kind(), "progress");
    }
}
