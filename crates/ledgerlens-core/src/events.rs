//! Session lifecycle signals for the UI and telemetry layers.
//!
//! Delivery is best effort: a sink that cannot deliver logs and moves on.

use ledgerlens_warehouse::SessionId;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated {
        session: SessionId,
    },
    IngestionCompleted {
        session: SessionId,
        rows: u64,
    },
    IngestionFailed {
        session: SessionId,
        reason: String,
        rows_committed: u64,
    },
    DataCleared {
        session: SessionId,
    },
}

impl SessionEvent {
    pub fn session(&self) -> &SessionId {
        match self {
            Self::SessionCreated { session }
            | Self::IngestionCompleted { session, .. }
            | Self::IngestionFailed { session, .. }
            | Self::DataCleared { session } => session,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::IngestionCompleted { .. } => "ingestion_completed",
            Self::IngestionFailed { .. } => "ingestion_failed",
            Self::DataCleared { .. } => "data_cleared",
        }
    }
}

/// Receives session events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SessionEvent);
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &SessionEvent) {
        match event {
            SessionEvent::IngestionFailed {
                session,
                reason,
                rows_committed,
            } => tracing::warn!(
                event = event.name(),
                session = %session,
                rows_committed,
                reason = reason.as_str(),
                "session event"
            ),
            SessionEvent::IngestionCompleted { session, rows } => {
                tracing::info!(event = event.name(), session = %session, rows, "session event")
            }
            other => tracing::info!(event = other.name(), session = %other.session(), "session event"),
        }
    }
}

/// Forwards events to a channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &SessionEvent) {
        if self.sender.send(event.clone()).is_err() {
            tracing::debug!(event = event.name(), "event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_forwards_and_survives_closed_receiver() {
        let (sink, mut receiver) = ChannelEventSink::new();
        let session = SessionId::generate();

        sink.emit(&SessionEvent::DataCleared {
            session: session.clone(),
        });
        let received = receiver.try_recv().expect("event");
        assert_eq!(received.name(), "data_cleared");
        assert_eq!(received.session(), &session);

        drop(receiver);
        sink.emit(&SessionEvent::SessionCreated { session });
    }

    #[test]
    fn events_serialize_with_tag() {
        let session = SessionId::parse("abc").expect("session");
        let value = serde_json::to_value(SessionEvent::IngestionFailed {
            session,
            reason: String::from("batch 3 failed"),
            rows_committed: 2000,
        })
        .expect("json");

        assert_eq!(value["event"], "ingestion_failed");
        assert_eq!(value["session"], "abc");
        assert_eq!(value["rows_committed"], 2000);
    }
}
