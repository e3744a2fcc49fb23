// src/bus/mod.rs

//! Publish/subscribe primitive the coordinator talks through
//!
//! Messages carrying a `recipient` are routed to the single [`Route`]
//! registered under that name. Messages without one are broadcast to every
//! handler subscribed to their `type`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::correlation::CorrelationId;
use crate::error::Result;

mod local;

pub use local::{BusStats, LocalBus};

/// Subscribes to every message type
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl BusMessage {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            recipient: None,
            correlation_id: None,
            sender: None,
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Correlation ID from the envelope, falling back to `payload.correlationId`
    pub fn correlation(&self) -> Option<CorrelationId> {
        self.correlation_id.clone().or_else(|| {
            self.payload
                .get("correlationId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(CorrelationId::from)
        })
    }
}

/// Callback invoked synchronously for each delivered message
pub type BusHandler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Delivery target for addressed messages
pub trait Route: Send + Sync {
    fn deliver(&self, message: BusMessage) -> Result<()>;
}

impl<F> Route for F
where
    F: Fn(BusMessage) -> Result<()> + Send + Sync,
{
    fn deliver(&self, message: BusMessage) -> Result<()> {
        self(message)
    }
}

pub trait MessageBus: Send + Sync {
    /// Publishes `message`. Fails when the bus is closed or an addressed
    /// message has no route.
    fn send(&self, message: BusMessage) -> Result<()>;

    fn subscribe(&self, event_type: &str, handler: BusHandler) -> Result<Subscription>;
}

/// Live subscription handle; dropping it unsubscribes.
///
/// Once `unsubscribe` returns, the handler is never invoked again.
pub struct Subscription {
    id: Uuid,
    event_type: String,
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        id: Uuid,
        event_type: impl Into<String>,
        teardown: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn unsubscribe(mut self) {
        self.run_teardown();
    }

    fn run_teardown(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_teardown();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("active", &self.teardown.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_wire_shape() {
        let message = BusMessage::new("user_input", json!({"message": "hi"}))
            .with_recipient("input")
            .with_correlation_id("req-1".into());

        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["type"], "user_input");
        assert_eq!(wire["correlationId"], "req-1");
        assert_eq!(wire["recipient"], "input");
        assert!(wire.get("sender").is_none());

        let back: BusMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_correlation_falls_back_to_payload() {
        let message = BusMessage::new("agent_response", json!({"correlationId": "c7"}));
        assert_eq!(message.correlation(), Some(CorrelationId::from("c7")));

        let empty = BusMessage::new("agent_response", json!({"correlationId": ""}));
        assert_eq!(empty.correlation(), None);
    }

    #[test]
    fn test_subscription_teardown_runs_once() {
        let torn_down = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&torn_down);
        let subscription = Subscription::new(Uuid::new_v4(), "x", move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });

        subscription.unsubscribe();
        assert!(torn_down.load(Ordering::SeqCst));
    }
}
