//! Topic-based event bridge
//!
//! Stages are triggered by externally supplied events and the run is stopped by a
//! shutdown event; both travel through an [`EventBroker`]. Payloads are opaque
//! [`PropertySet`]s except for the few well-known fields read by the harness itself.

pub mod memory;

pub use memory::InMemoryBroker;

use crate::error::{HarnessError, HarnessResult};
use crate::value::PropertySet;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Topic names and payload fields - centralized for consistency
pub mod event_names {
    pub const DEFAULT_SHUTDOWN_TOPIC: &str = "triggerShutdownEvent";
    pub const NO_TOPIC: &str = "None";
    pub const LEVEL: &str = "level";
    pub const RUN_ID: &str = "runId";
    pub const EXIT_MESSAGE_PREFIX: &str = "exiting_";
}

/// Topic on which the coordinator republishes a stage event for the slices
///
/// Carries the pipeline name so pipelines sharing a broker keep their slices apart.
pub fn slice_topic(topic: &str, pipeline: &str) -> String {
    format!("{}_{}", topic, pipeline)
}

/// Publish/subscribe transport shared by the coordinator, the slices and the stages
pub trait EventBroker: Send + Sync {
    /// Address of the broker, passed on to stages as part of their context
    fn host(&self) -> &str;

    /// Deliver a payload to every current subscriber of `topic`
    fn publish(&self, topic: &str, payload: PropertySet) -> HarnessResult<()>;

    /// Register interest in `topic`
    fn subscribe(&self, topic: &str) -> HarnessResult<Box<dyn EventReceiver>>;
}

/// Receiving end of a topic subscription
pub trait EventReceiver: Send {
    fn topic(&self) -> &str;

    /// Wait up to `timeout` for the next event; `None` when nothing arrived
    fn receive(&self, timeout: Duration) -> HarnessResult<Option<PropertySet>>;

    /// Take the next event if one is already waiting
    fn try_receive(&self) -> HarnessResult<Option<PropertySet>> {
        self.receive(Duration::ZERO)
    }
}

/// How far a run may proceed after a shutdown request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShutdownLevel {
    /// Terminate immediately
    Immediate = 1,
    AtSyncPoint = 2,
    AtStageEnd = 3,
    AtVisitEnd = 4,
}

impl ShutdownLevel {
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(ShutdownLevel::Immediate),
            2 => Some(ShutdownLevel::AtSyncPoint),
            3 => Some(ShutdownLevel::AtStageEnd),
            4 => Some(ShutdownLevel::AtVisitEnd),
            _ => None,
        }
    }

    /// Levels 2 to 4 all go through the graceful stop path
    pub fn is_graceful(&self) -> bool {
        !matches!(self, ShutdownLevel::Immediate)
    }
}

/// Shutdown request as carried on the shutdown topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownEvent {
    pub level: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ShutdownEvent {
    pub fn new(level: ShutdownLevel, run_id: Option<String>) -> Self {
        Self {
            level: level as i64,
            run_id,
        }
    }

    pub fn from_payload(payload: &PropertySet) -> HarnessResult<Self> {
        from_payload(payload)
    }

    pub fn to_payload(&self) -> HarnessResult<PropertySet> {
        to_payload(self)
    }

    /// Whether the request is addressed to `run_id`; unscoped requests match every run
    pub fn applies_to(&self, run_id: &str) -> bool {
        self.run_id.as_deref().map(|r| r == run_id).unwrap_or(true)
    }
}

/// Published on the exit topic once the coordinator has shut down
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitEvent {
    pub message: String,
    pub run_id: String,
    pub timestamp: String,
}

impl ExitEvent {
    pub fn new(run_id: &str) -> Self {
        Self {
            message: format!("{}{}", event_names::EXIT_MESSAGE_PREFIX, run_id),
            run_id: run_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn to_payload(&self) -> HarnessResult<PropertySet> {
        to_payload(self)
    }
}

fn to_payload<T: Serialize>(event: &T) -> HarnessResult<PropertySet> {
    Ok(serde_json::from_value(serde_json::to_value(event)?)?)
}

fn from_payload<T: for<'de> Deserialize<'de>>(payload: &PropertySet) -> HarnessResult<T> {
    serde_json::from_value(serde_json::to_value(payload)?)
        .map_err(|e| HarnessError::Event(format!("Malformed event payload {}: {}", payload, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_slice_topic() {
        assert_eq!(slice_topic("triggerVisit", "area"), "triggerVisit_area");
        assert_ne!(
            slice_topic("triggerVisit", "area"),
            slice_topic("triggerVisit", "volume")
        );
    }

    #[test]
    fn test_shutdown_levels() {
        assert_eq!(ShutdownLevel::from_level(1), Some(ShutdownLevel::Immediate));
        assert_eq!(ShutdownLevel::from_level(4), Some(ShutdownLevel::AtVisitEnd));
        assert_eq!(ShutdownLevel::from_level(7), None);
        assert!(!ShutdownLevel::Immediate.is_graceful());
        assert!(ShutdownLevel::AtSyncPoint.is_graceful());
        assert!(ShutdownLevel::AtStageEnd.is_graceful());
    }

    #[test]
    fn test_shutdown_event_payload() {
        let event = ShutdownEvent::new(ShutdownLevel::AtVisitEnd, Some("run-1".into()));
        let payload = event.to_payload().unwrap();
        assert_eq!(payload.get(event_names::LEVEL), Some(&Value::Int(4)));
        assert_eq!(payload.get_str(event_names::RUN_ID), Some("run-1"));

        let parsed = ShutdownEvent::from_payload(&payload).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_shutdown_event_run_filter() {
        let scoped = ShutdownEvent::new(ShutdownLevel::AtVisitEnd, Some("run-1".into()));
        assert!(scoped.applies_to("run-1"));
        assert!(!scoped.applies_to("run-2"));

        let unscoped = ShutdownEvent::new(ShutdownLevel::AtVisitEnd, None);
        assert!(unscoped.applies_to("anything"));
    }

    #[test]
    fn test_malformed_shutdown_payload() {
        let payload = PropertySet::new().with("level", "soon");
        assert!(matches!(
            ShutdownEvent::from_payload(&payload),
            Err(HarnessError::Event(_))
        ));
    }

    #[test]
    fn test_exit_event_message() {
        let event = ExitEvent::new("run-7");
        assert_eq!(event.message, "exiting_run-7");
        let payload = event.to_payload().unwrap();
        assert_eq!(payload.get_str("runId"), Some("run-7"));
        assert!(payload.contains("timestamp"));
    }
}
