// src/multiplexer.rs

//! One bus subscription per inbound category, demultiplexed into an
//! [`InboundSink`]

use std::sync::{Arc, Weak};

use crate::ambient::AmbientUpdate;
use crate::bus::{BusHandler, BusMessage, MessageBus, Subscription};
use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::reconcile::{DirectResponse, PersistedNotification};
use crate::types::{EntityChange, EntityKind};

/// Receiver of parsed inbound events
pub trait InboundSink: Send + Sync {
    fn direct_response(&self, response: DirectResponse);

    fn persisted(&self, notification: PersistedNotification);

    fn ambient(&self, update: AmbientUpdate);

    fn malformed(&self, message: &BusMessage, error: Error);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCategory {
    DirectResponse,
    Persisted(EntityKind, EntityChange),
    Suggestions,
    Status,
}

impl InboundCategory {
    /// Every category and the event type it listens on
    pub fn all(config: &BusConfig) -> Vec<(String, InboundCategory)> {
        let mut categories = vec![(
            config.direct_response_event.clone(),
            InboundCategory::DirectResponse,
        )];
        for kind in EntityKind::ALL {
            for change in EntityChange::ALL {
                categories.push((kind.event_name(change), InboundCategory::Persisted(kind, change)));
            }
        }
        categories.push((config.suggestion_event.clone(), InboundCategory::Suggestions));
        categories.push((config.status_event.clone(), InboundCategory::Status));
        categories
    }

    fn dispatch(self, message: &BusMessage, sink: &dyn InboundSink) {
        let parsed = match self {
            Self::DirectResponse => {
                DirectResponse::from_message(message).map(|response| sink.direct_response(response))
            }
            Self::Persisted(kind, change) => parse_record(message)
                .map(|record| sink.persisted(PersistedNotification::new(kind, change, record))),
            Self::Suggestions => {
                AmbientUpdate::suggestions(&message.payload).map(|update| sink.ambient(update))
            }
            Self::Status => AmbientUpdate::status(&message.payload).map(|update| sink.ambient(update)),
        };

        if let Err(error) = parsed {
            tracing::warn!(
                message_type = %message.message_type,
                error = %error,
                "Dropping malformed inbound message"
            );
            sink.malformed(message, error);
        }
    }
}

/// Accepts either the bare record or `{record: {...}}`
fn parse_record(message: &BusMessage) -> Result<serde_json::Value> {
    let payload = &message.payload;
    let record = match payload.get("record") {
        Some(record) if record.is_object() => record,
        _ => payload,
    };
    if !record.is_object() {
        return Err(Error::validation("payload", "persisted notification is not an object"));
    }
    Ok(record.clone())
}

#[derive(Debug, Default)]
pub struct SubscriptionMultiplexer {
    subscriptions: Vec<Subscription>,
    closed: bool,
}

impl SubscriptionMultiplexer {
    /// Subscribes every category. If any subscription fails the ones already
    /// made are torn down and the error is returned.
    pub fn attach(
        bus: &dyn MessageBus,
        config: &BusConfig,
        sink: Weak<dyn InboundSink>,
    ) -> Result<Self> {
        let mut subscriptions = Vec::new();

        for (event_type, category) in InboundCategory::all(config) {
            let sink = sink.clone();
            let handler: BusHandler = Arc::new(move |message: &BusMessage| {
                if let Some(sink) = sink.upgrade() {
                    category.dispatch(message, sink.as_ref());
                }
            });
            subscriptions.push(bus.subscribe(&event_type, handler)?);
        }

        tracing::debug!(subscriptions = subscriptions.len(), "Multiplexer attached");
        Ok(Self {
            subscriptions,
            closed: false,
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Unsubscribes everything; returns how many subscriptions were removed
    pub fn teardown(&mut self) -> usize {
        self.closed = true;
        let count = self.subscriptions.len();
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        if count > 0 {
            tracing::debug!(subscriptions = count, "Multiplexer torn down");
        }
        count
    }
}

impl Drop for SubscriptionMultiplexer {
    fn drop(&mut self) {
        self.teardown();
    }
}
