// src/bus/local.rs

//! In-process bus with synchronous delivery

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BusHandler, BusMessage, MessageBus, Route, Subscription, WILDCARD};
use crate::config::BusConfig;
use crate::error::{Error, ErrorKind, EventOperation, Result};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub total_sent: u64,
    pub total_routed: u64,
    pub total_broadcast: u64,
    pub handler_invocations: u64,
    pub handler_panics: u64,
    pub undeliverable: u64,
    pub messages_by_type: HashMap<String, u64>,
    pub active_subscriptions: usize,
    pub registered_routes: usize,
}

struct BusSubscriber {
    event_type: String,
    sequence: u64,
    handler: BusHandler,
    active: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for BusSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSubscriber")
            .field("event_type", &self.event_type)
            .field("sequence", &self.sequence)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("created_at", &self.created_at)
            .finish()
    }
}

pub struct LocalBus {
    state: ManagedState,
    config: BusConfig,
    subscribers: Arc<DashMap<Uuid, BusSubscriber>>,
    routes: DashMap<String, Arc<dyn Route>>,
    stats: Arc<RwLock<BusStats>>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("config", &self.config)
            .field("subscribers", &self.subscribers.len())
            .field("routes", &self.routes.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "local_bus"),
            config,
            subscribers: Arc::new(DashMap::new()),
            routes: DashMap::new(),
            stats: Arc::new(RwLock::new(BusStats::default())),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers the delivery target for messages addressed to `recipient`,
    /// replacing any previous one.
    pub fn register_route(&self, recipient: impl Into<String>, route: Arc<dyn Route>) {
        let recipient = recipient.into();
        if self.routes.insert(recipient.clone(), route).is_some() {
            tracing::debug!(%recipient, "Replaced bus route");
        }
        self.stats.write().registered_routes = self.routes.len();
    }

    pub fn remove_route(&self, recipient: &str) -> bool {
        let removed = self.routes.remove(recipient).is_some();
        self.stats.write().registered_routes = self.routes.len();
        removed
    }

    pub fn has_route(&self, recipient: &str) -> bool {
        self.routes.contains_key(recipient)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stats(&self) -> BusStats {
        let mut stats = self.stats.read().clone();
        stats.active_subscriptions = self.subscribers.len();
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting messages and drops every subscriber and route
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.subscribers.iter() {
            entry.value().active.store(false, Ordering::Release);
        }
        self.subscribers.clear();
        self.routes.clear();

        let mut stats = self.stats.write();
        stats.active_subscriptions = 0;
        stats.registered_routes = 0;
    }

    fn route(&self, recipient: &str, message: BusMessage) -> Result<()> {
        // clone the route out so no map guard is held while it runs
        let route = self
            .routes
            .get(recipient)
            .map(|entry| Arc::clone(entry.value()));

        let Some(route) = route else {
            self.stats.write().undeliverable += 1;
            return Err(Error::transport(
                Some(recipient.to_string()),
                format!("No route registered for recipient '{}'", recipient),
            ));
        };

        self.stats.write().total_routed += 1;
        route.deliver(message).map_err(|e| {
            Error::transport(
                Some(recipient.to_string()),
                format!("Delivery to '{}' failed", recipient),
            )
            .caused_by(e)
        })
    }

    fn broadcast(&self, message: &BusMessage) {
        let mut matching: Vec<(u64, Arc<AtomicBool>, BusHandler)> = self
            .subscribers
            .iter()
            .filter_map(|entry| {
                let subscriber = entry.value();
                let matches = subscriber.event_type == message.message_type
                    || subscriber.event_type == WILDCARD;
                (matches && subscriber.active.load(Ordering::Acquire)).then(|| {
                    (
                        subscriber.sequence,
                        Arc::clone(&subscriber.active),
                        Arc::clone(&subscriber.handler),
                    )
                })
            })
            .collect();
        matching.sort_by_key(|(sequence, _, _)| *sequence);

        let mut invocations = 0u64;
        let mut panics = 0u64;
        for (_, active, handler) in matching {
            // a handler earlier in this pass may have unsubscribed this one
            if !active.load(Ordering::Acquire) {
                continue;
            }
            invocations += 1;
            if self.config.isolate_handler_panics {
                if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    panics += 1;
                    tracing::error!(
                        message_type = %message.message_type,
                        "Bus handler panicked; continuing delivery"
                    );
                }
            } else {
                handler(message);
            }
        }

        let mut stats = self.stats.write();
        stats.total_broadcast += 1;
        stats.handler_invocations += invocations;
        stats.handler_panics += panics;
    }
}

impl MessageBus for LocalBus {
    fn send(&self, message: BusMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::transport(
                message.recipient.clone(),
                "Bus is closed",
            ));
        }

        {
            let mut stats = self.stats.write();
            stats.total_sent += 1;
            *stats
                .messages_by_type
                .entry(message.message_type.clone())
                .or_insert(0) += 1;
        }

        tracing::trace!(
            message_type = %message.message_type,
            recipient = ?message.recipient,
            correlation_id = ?message.correlation_id,
            "Bus send"
        );

        match message.recipient.clone() {
            Some(recipient) => self.route(&recipient, message),
            None => {
                self.broadcast(&message);
                Ok(())
            }
        }
    }

    fn subscribe(&self, event_type: &str, handler: BusHandler) -> Result<Subscription> {
        if self.is_closed() {
            return Err(Error::new(
                ErrorKind::Event {
                    event_type: Some(event_type.to_string()),
                    subscription_id: None,
                    operation: EventOperation::Subscribe,
                },
                "Bus is closed",
            ));
        }

        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        self.subscribers.insert(
            id,
            BusSubscriber {
                event_type: event_type.to_string(),
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                handler,
                active: Arc::clone(&active),
                created_at: Utc::now(),
            },
        );

        let subscribers = Arc::downgrade(&self.subscribers);
        let subscribed_type = event_type.to_string();
        Ok(Subscription::new(id, event_type, move || {
            active.store(false, Ordering::Release);
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.remove(&id);
            }
            tracing::trace!(subscription_id = %id, event_type = %subscribed_type, "Unsubscribed");
        }))
    }
}

#[async_trait]
impl Manager for LocalBus {
    fn name(&self) -> &str {
        "local_bus"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;
        self.closed.store(false, Ordering::Release);
        self.state.set_state(ManagerState::Running).await;
        tracing::info!("Local bus ready");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;
        self.close();
        self.state.set_state(ManagerState::Shutdown).await;
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let stats = self.stats();

        status.add_metadata("total_sent", serde_json::Value::from(stats.total_sent));
        status.add_metadata("handler_panics", serde_json::Value::from(stats.handler_panics));
        status.add_metadata(
            "active_subscriptions",
            serde_json::Value::from(stats.active_subscriptions),
        );
        status.add_metadata("registered_routes", serde_json::Value::from(stats.registered_routes));
        status.add_metadata("closed", serde_json::Value::Bool(self.is_closed()));

        status
    }
}
