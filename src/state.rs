// src/state.rs

//! Everything the coordinator tracks for one session, guarded as a unit

use std::collections::HashMap;

use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ambient::AmbientState;
use crate::config::CoordinationConfig;
use crate::correlation::CorrelationId;
use crate::lifecycle::{LifecycleTable, Resolution};
use crate::placeholder::PlaceholderManager;
use crate::registry::PendingRequestRegistry;
use crate::result_cache::PendingResultCache;
use crate::view::EntityView;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub dispatched: u64,
    pub direct_responses: u64,
    pub notifications: u64,
    pub merges: u64,
    pub late_patches: u64,
    pub stale_events: u64,
    pub duplicate_notifications: u64,
    pub backend_failures: u64,
    pub transport_failures: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub orphaned_results: u64,
    pub expired_placeholders: u64,
    pub malformed_messages: u64,
    pub ambient_updates: u64,
    pub pending_requests: usize,
    pub pending_results: usize,
    pub placeholders: usize,
    pub entities: usize,
}

/// A terminal resolution plus the waiters it must reach, delivered only
/// after the state lock is released
#[derive(Debug)]
pub struct Settlement {
    pub resolution: Resolution,
    waiters: Vec<oneshot::Sender<Resolution>>,
}

impl Settlement {
    pub fn deliver(self, resolutions: &broadcast::Sender<Resolution>) {
        for waiter in self.waiters {
            let _ = waiter.send(self.resolution.clone());
        }
        // no receivers is fine
        let _ = resolutions.send(self.resolution);
    }
}

#[derive(Debug)]
pub struct CorrelationState {
    pub registry: PendingRequestRegistry,
    pub results: PendingResultCache,
    pub placeholders: PlaceholderManager,
    pub view: EntityView,
    pub lifecycle: LifecycleTable,
    pub ambient: AmbientState,
    pub stats: RelayStats,
    waiters: HashMap<CorrelationId, Vec<oneshot::Sender<Resolution>>>,
    opened: bool,
    closed: bool,
}

impl CorrelationState {
    pub fn new(config: &CoordinationConfig) -> Self {
        Self {
            registry: PendingRequestRegistry::new(),
            results: PendingResultCache::new(),
            placeholders: PlaceholderManager::new(),
            view: EntityView::new(config.max_notices),
            lifecycle: LifecycleTable::new(),
            ambient: AmbientState::default(),
            stats: RelayStats::default(),
            waiters: HashMap::new(),
            opened: false,
            closed: false,
        }
    }

    /// Accepting dispatches and inbound events
    pub fn is_open(&self) -> bool {
        self.opened && !self.closed
    }

    /// Once closed, nothing reopens the state and inbound callbacks must not
    /// mutate anything
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn open(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.opened = true;
        true
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Registers a waiter for a pending operation
    pub fn wait_for(&mut self, correlation_id: &CorrelationId) -> Option<oneshot::Receiver<Resolution>> {
        if !self.registry.contains(correlation_id) {
            return None;
        }
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .entry(correlation_id.clone())
            .or_default()
            .push(sender);
        Some(receiver)
    }

    pub fn settle(&mut self, resolution: Resolution) -> Settlement {
        let waiters = self
            .waiters
            .remove(&resolution.correlation_id)
            .unwrap_or_default();
        Settlement { resolution, waiters }
    }

    /// Drops every waiter; their receivers observe cancellation
    pub fn abandon_waiters(&mut self) -> usize {
        let count = self.waiters.values().map(Vec::len).sum();
        self.waiters.clear();
        count
    }

    pub fn stats_snapshot(&self) -> RelayStats {
        let mut stats = self.stats.clone();
        stats.pending_requests = self.registry.len();
        stats.pending_results = self.results.len();
        stats.placeholders = self.placeholders.len();
        stats.entities = self.view.len();
        stats
    }

    /// True when no fragment of `correlation_id` is tracked anywhere
    pub fn is_untracked(&self, correlation_id: &CorrelationId) -> bool {
        !self.registry.contains(correlation_id)
            && !self.results.contains(correlation_id)
            && !self.placeholders.contains(correlation_id)
            && self.lifecycle.phase(correlation_id).is_none()
            && !self.waiters.contains_key(correlation_id)
    }
}
