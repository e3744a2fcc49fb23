// src/coordinator.rs

//! Session-scoped owner of all correlation state
//!
//! The coordinator is the only thing callers talk to. Every mutation runs
//! under one lock; resolutions go out after the lock is released.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ambient::{AmbientState, AmbientUpdate};
use crate::bus::{BusMessage, MessageBus};
use crate::config::{BusConfig, CoordinationConfig};
use crate::correlation::CorrelationId;
use crate::dispatcher::{self, DispatchRequest};
use crate::error::{Error, ManagerOperation, Result};
use crate::lifecycle::{FailureReason, OperationPhase, Resolution};
use crate::multiplexer::{InboundSink, SubscriptionMultiplexer};
use crate::placeholder::OptimisticPlaceholder;
use crate::reconcile::{self, DirectResponse, PersistedNotification};
use crate::registry::PendingRequest;
use crate::state::{CorrelationState, RelayStats, Settlement};
use crate::sweep::{self, SweepSummary, Sweepable};
use crate::types::EntityKind;
use crate::view::{EntityRecord, FailureNotice, VisibleEntry};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};

const NAME: &str = "coordination_manager";

struct RelayCore {
    config: CoordinationConfig,
    bus: Arc<dyn MessageBus>,
    state: Mutex<CorrelationState>,
    resolutions: broadcast::Sender<Resolution>,
}

impl RelayCore {
    fn deliver(&self, settlements: impl IntoIterator<Item = Settlement>) {
        for settlement in settlements {
            settlement.deliver(&self.resolutions);
        }
    }
}

impl InboundSink for RelayCore {
    fn direct_response(&self, response: DirectResponse) {
        let settlement = {
            let mut state = self.state.lock();
            if !state.is_open() {
                return;
            }
            reconcile::on_direct_response(&mut state, &self.config, response).1
        };
        self.deliver(settlement);
    }

    fn persisted(&self, notification: PersistedNotification) {
        let mut state = self.state.lock();
        if !state.is_open() {
            return;
        }
        let kind = notification.kind;
        if let Err(e) = reconcile::on_persisted_notification(&mut state, &self.config, notification) {
            state.stats.malformed_messages += 1;
            tracing::warn!(?kind, error = %e, "Dropping unusable persisted notification");
        }
    }

    fn ambient(&self, update: AmbientUpdate) {
        let mut state = self.state.lock();
        if !state.is_open() {
            return;
        }
        let session_user = self.config.session_user_id.as_deref();
        if state.ambient.apply(update, session_user) {
            state.stats.ambient_updates += 1;
        }
    }

    fn malformed(&self, _message: &BusMessage, _error: Error) {
        let mut state = self.state.lock();
        if state.is_open() {
            state.stats.malformed_messages += 1;
        }
    }
}

impl Sweepable for RelayCore {
    fn sweep(&self, now: Instant) -> SweepSummary {
        let report = {
            let mut state = self.state.lock();
            if !state.is_open() {
                return SweepSummary::default();
            }
            sweep::sweep_expired(&mut state, &self.config, now)
        };
        let summary = report.summary();
        self.deliver(report.settlements);
        summary
    }
}

pub struct CoordinationManager {
    state: ManagedState,
    bus_config: BusConfig,
    core: Arc<RelayCore>,
    multiplexer: Option<SubscriptionMultiplexer>,
    sweeper: Option<(CancellationToken, JoinHandle<()>)>,
}

impl fmt::Debug for CoordinationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationManager")
            .field("config", &self.core.config)
            .field("attached", &self.multiplexer.is_some())
            .field("sweeping", &self.sweeper.is_some())
            .finish()
    }
}

impl CoordinationManager {
    pub fn new(config: CoordinationConfig, bus_config: BusConfig, bus: Arc<dyn MessageBus>) -> Self {
        let (resolutions, _) = broadcast::channel(config.resolution_buffer.max(1));
        let state = Mutex::new(CorrelationState::new(&config));

        Self {
            state: ManagedState::new(Uuid::new_v4(), NAME),
            bus_config,
            core: Arc::new(RelayCore {
                config,
                bus,
                state,
                resolutions,
            }),
            multiplexer: None,
            sweeper: None,
        }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.core.config
    }

    /// Dispatches `payload` to `recipient` with the kind's defaults
    pub fn dispatch(
        &self,
        kind: crate::types::RequestKind,
        payload: Value,
        recipient: impl Into<String>,
    ) -> Result<CorrelationId> {
        self.dispatch_with(DispatchRequest::new(kind, payload, recipient))
    }

    pub fn dispatch_with(&self, request: DispatchRequest) -> Result<CorrelationId> {
        let (correlation_id, message) = {
            let mut state = self.core.state.lock();
            if !state.is_open() {
                return Err(Error::manager(
                    NAME,
                    ManagerOperation::Operation("dispatch".to_string()),
                    "Coordinator is not running",
                ));
            }
            dispatcher::register(&mut state, &self.core.config, request)?
        };

        // lock released: the bus may answer re-entrantly
        if let Err(error) = self.core.bus.send(message) {
            let error = error.correlation_id(correlation_id.clone());
            tracing::warn!(%correlation_id, error = %error, "Publish failed; rolled back");
            let settlement = {
                let mut state = self.core.state.lock();
                dispatcher::rollback(&mut state, &correlation_id, &error)
            };
            self.core.deliver(settlement);
            return Err(error);
        }

        Ok(correlation_id)
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.core.state.lock().registry.contains(correlation_id)
    }

    pub fn phase(&self, correlation_id: &CorrelationId) -> Option<OperationPhase> {
        self.core.state.lock().lifecycle.phase(correlation_id)
    }

    /// Abandons a pending operation. Returns whether anything was pending.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        let settlement = {
            let mut state = self.core.state.lock();
            reconcile::fail_pending(
                &mut state,
                correlation_id,
                FailureReason::Cancelled,
                "Cancelled by caller",
            )
        };
        let cancelled = settlement.is_some();
        if cancelled {
            tracing::debug!(%correlation_id, "Operation cancelled");
        }
        self.core.deliver(settlement);
        cancelled
    }

    /// Completes with the operation's terminal resolution; `None` when the
    /// ID is not pending
    pub fn resolution_of(
        &self,
        correlation_id: &CorrelationId,
    ) -> Option<oneshot::Receiver<Resolution>> {
        self.core.state.lock().wait_for(correlation_id)
    }

    pub fn subscribe_resolutions(&self) -> broadcast::Receiver<Resolution> {
        self.core.resolutions.subscribe()
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.core.state.lock().registry.snapshot()
    }

    pub fn entities(&self, kind: EntityKind) -> Vec<EntityRecord> {
        self.core.state.lock().view.of_kind(kind)
    }

    pub fn entity(&self, id: &str) -> Option<EntityRecord> {
        self.core.state.lock().view.get(id).cloned()
    }

    pub fn entity_for(&self, correlation_id: &CorrelationId) -> Option<EntityRecord> {
        self.core
            .state
            .lock()
            .view
            .by_correlation(correlation_id)
            .cloned()
    }

    pub fn placeholders(&self) -> Vec<OptimisticPlaceholder> {
        self.core.state.lock().placeholders.visible()
    }

    /// Persisted entities followed by provisional placeholders
    pub fn visible_entries(&self) -> Vec<VisibleEntry> {
        let state = self.core.state.lock();
        state
            .view
            .all()
            .into_iter()
            .map(VisibleEntry::Entity)
            .chain(
                state
                    .placeholders
                    .visible()
                    .into_iter()
                    .map(VisibleEntry::Placeholder),
            )
            .collect()
    }

    pub fn notices(&self) -> Vec<FailureNotice> {
        self.core.state.lock().view.notices()
    }

    pub fn clear_notices(&self) {
        self.core.state.lock().view.clear_notices();
    }

    pub fn ambient(&self) -> AmbientState {
        self.core.state.lock().ambient.clone()
    }

    pub fn stats(&self) -> RelayStats {
        self.core.state.lock().stats_snapshot()
    }

    /// True when no state of any kind is held for `correlation_id`
    pub fn is_untracked(&self, correlation_id: &CorrelationId) -> bool {
        self.core.state.lock().is_untracked(correlation_id)
    }

    /// Runs one expiry pass immediately
    pub fn sweep_now(&self) -> SweepSummary {
        self.core.sweep(Instant::now())
    }
}

#[async_trait]
impl Manager for CoordinationManager {
    fn name(&self) -> &str {
        NAME
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        if self.core.state.lock().is_closed() {
            self.state.set_state(ManagerState::Error).await;
            return Err(Error::manager(
                NAME,
                ManagerOperation::Initialize,
                "A shut down coordinator cannot be reinitialized",
            ));
        }

        let core: Arc<dyn InboundSink> = self.core.clone();
        let sink: Weak<dyn InboundSink> = Arc::downgrade(&core);
        drop(core);
        let multiplexer =
            match SubscriptionMultiplexer::attach(self.core.bus.as_ref(), &self.bus_config, sink) {
                Ok(multiplexer) => multiplexer,
                Err(e) => {
                    self.state.set_state(ManagerState::Error).await;
                    return Err(Error::manager(
                        NAME,
                        ManagerOperation::Initialize,
                        "Failed to subscribe to the bus",
                    )
                    .caused_by(e));
                }
            };
        self.multiplexer = Some(multiplexer);
        self.core.state.lock().open();

        let token = CancellationToken::new();
        let handle = sweep::spawn_sweeper(
            Arc::downgrade(&self.core),
            self.core.config.sweep_interval(),
            token.clone(),
        );
        self.sweeper = Some((token, handle));

        self.state.set_state(ManagerState::Running).await;
        tracing::info!(
            request_timeout_ms = self.core.config.request_timeout_ms,
            result_ttl_ms = self.core.config.result_ttl_ms,
            "Coordination manager running"
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;

        let abandoned = {
            let mut state = self.core.state.lock();
            state.close();
            state.abandon_waiters()
        };
        if let Some(mut multiplexer) = self.multiplexer.take() {
            multiplexer.teardown();
        }
        if let Some((token, handle)) = self.sweeper.take() {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Sweeper task ended abnormally");
            }
        }

        self.state.set_state(ManagerState::Shutdown).await;
        tracing::info!(abandoned_waiters = abandoned, "Coordination manager stopped");
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let stats = self.stats();

        status.add_metadata("pending_requests", Value::from(stats.pending_requests));
        status.add_metadata("pending_results", Value::from(stats.pending_results));
        status.add_metadata("placeholders", Value::from(stats.placeholders));
        status.add_metadata("entities", Value::from(stats.entities));
        status.add_metadata("stale_events", Value::from(stats.stale_events));
        status.add_metadata("timeouts", Value::from(stats.timeouts));

        status
    }

    async fn get_config(&self) -> Option<Value> {
        serde_json::to_value(&self.core.config).ok()
    }

    fn is_essential(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::types::RequestKind;
    use serde_json::json;

    fn bus_with_sink() -> (Arc<LocalBus>, Arc<Mutex<Vec<BusMessage>>>) {
        let bus = Arc::new(LocalBus::new(BusConfig::default()));
        let outbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outbox);
        bus.register_route(
            "input",
            Arc::new(move |message: BusMessage| -> Result<()> {
                sink.lock().push(message);
                Ok(())
            }),
        );
        (bus, outbox)
    }

    async fn running(bus: &Arc<LocalBus>) -> CoordinationManager {
        let mut coordinator = CoordinationManager::new(
            CoordinationConfig::default(),
            BusConfig::default(),
            bus.clone(),
        );
        coordinator.initialize().await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_dispatch_publishes_and_tracks() {
        let (bus, outbox) = bus_with_sink();
        let coordinator = running(&bus).await;

        let id = coordinator
            .dispatch(RequestKind::UserMessage, json!({"message": "hi"}), "input")
            .unwrap();

        assert!(coordinator.is_pending(&id));
        assert_eq!(coordinator.placeholders().len(), 1);
        let sent = outbox.lock();
        assert_eq!(sent[0].correlation_id.as_ref(), Some(&id));
        assert_eq!(sent[0].recipient.as_deref(), Some("input"));
    }

    #[tokio::test]
    async fn test_dispatch_without_route_rolls_back() {
        let (bus, _outbox) = bus_with_sink();
        let coordinator = running(&bus).await;
        let mut resolutions = coordinator.subscribe_resolutions();

        let err = coordinator
            .dispatch(RequestKind::UserMessage, json!({"message": "hi"}), "nowhere")
            .unwrap_err();

        assert!(matches!(err.kind, crate::error::ErrorKind::Transport { .. }));
        let id = err.correlation_id.clone().unwrap();
        assert!(coordinator.is_untracked(&id));
        assert!(coordinator.placeholders().is_empty());
        assert_eq!(coordinator.notices()[0].reason, FailureReason::Transport);
        assert_eq!(
            resolutions.recv().await.unwrap().failure_reason(),
            Some(FailureReason::Transport)
        );
    }

    #[tokio::test]
    async fn test_dispatch_requires_running() {
        let (bus, _outbox) = bus_with_sink();
        let coordinator = CoordinationManager::new(
            CoordinationConfig::default(),
            BusConfig::default(),
            bus,
        );
        assert!(coordinator
            .dispatch(RequestKind::GitSync, json!({}), "input")
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_resolves_waiters() {
        let (bus, _outbox) = bus_with_sink();
        let coordinator = running(&bus).await;
        let id = coordinator
            .dispatch(RequestKind::TaskControl, json!({"action": "pause"}), "input")
            .unwrap();

        let waiter = coordinator.resolution_of(&id).unwrap();
        assert!(coordinator.cancel(&id));
        assert!(!coordinator.cancel(&id));

        let resolution = waiter.await.unwrap();
        assert_eq!(resolution.failure_reason(), Some(FailureReason::Cancelled));
        assert!(coordinator.is_untracked(&id));
        assert!(coordinator.notices().is_empty());
    }

    #[test]
    fn test_managers_are_shareable() {
        fn shareable<T: Send + Sync>() {}
        shareable::<crate::bus::Subscription>();
        shareable::<SubscriptionMultiplexer>();
        shareable::<CoordinationManager>();
    }

    #[tokio::test]
    async fn test_shutdown_stops_mutation() {
        let (bus, _outbox) = bus_with_sink();
        let mut coordinator = running(&bus).await;
        let id = coordinator
            .dispatch(RequestKind::UserMessage, json!({"message": "hi"}), "input")
            .unwrap();
        let waiter = coordinator.resolution_of(&id).unwrap();

        coordinator.shutdown().await.unwrap();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(waiter.await.is_err());

        bus.send(BusMessage::new("status_update", json!({"status": "late"})))
            .unwrap();
        assert!(coordinator.ambient().status.is_none());
        assert!(coordinator.initialize().await.is_err());
    }
}
