//! Fire-and-forget event bus consumed by the reporting/dashboard layer.
//!
//! Publishing never fails: a bus with no subscribers simply drops the event.
//! Each published event is also mirrored to the events log, best-effort.

use crate::state::{Mirror, WriteJob};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AllianceFormed,
    AllianceExpired,
    Betrayal,
    Defection,
    PlanCreated,
    PlannerStepStarted,
    PlannerStepCompleted,
    PlannerStepFailed,
    CultDied,
    CultRevived,
    Evolution,
    GlobalChat,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllianceFormed => write!(f, "alliance_formed"),
            Self::AllianceExpired => write!(f, "alliance_expired"),
            Self::Betrayal => write!(f, "betrayal"),
            Self::Defection => write!(f, "defection"),
            Self::PlanCreated => write!(f, "plan_created"),
            Self::PlannerStepStarted => write!(f, "planner_step_started"),
            Self::PlannerStepCompleted => write!(f, "planner_step_completed"),
            Self::PlannerStepFailed => write!(f, "planner_step_failed"),
            Self::CultDied => write!(f, "cult_died"),
            Self::CultRevived => write!(f, "cult_revived"),
            Self::Evolution => write!(f, "evolution"),
            Self::GlobalChat => write!(f, "global_chat"),
        }
    }
}

/// A named event with an arbitrary JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Broadcast bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    mirror: Option<Mirror>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, mirror: None }
    }

    /// Attach a persistence mirror so published events reach the events log.
    pub fn with_mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Publish an event. Send errors (no subscribers) are ignored.
    pub fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        if let Some(mirror) = &self.mirror {
            mirror.write(WriteJob::Event {
                kind: kind.to_string(),
                payload_json: payload.to_string(),
            });
        }
        let _ = self.tx.send(Event {
            kind,
            payload,
            at: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(EventKind::GlobalChat, json!({"message": "the stars align"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::GlobalChat);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(EventKind::PlanCreated, json!({}));
    }
}
