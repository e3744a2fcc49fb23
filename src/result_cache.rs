// src/result_cache.rs

//! Response fragments that arrived before their persisted entity

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::correlation::CorrelationId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingResult {
    pub correlation_id: CorrelationId,
    pub decision: Option<Value>,
    pub auxiliary: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub created_instant: Instant,
}

impl PendingResult {
    pub fn new(
        correlation_id: CorrelationId,
        decision: Option<Value>,
        auxiliary: Option<Value>,
    ) -> Self {
        Self {
            correlation_id,
            decision,
            auxiliary,
            created_at: Utc::now(),
            created_instant: Instant::now(),
        }
    }

    /// A result with nothing to attach is never cached
    pub fn is_empty(&self) -> bool {
        self.decision.is_none() && self.auxiliary.is_none()
    }
}

#[derive(Debug, Default)]
pub struct PendingResultCache {
    results: HashMap<CorrelationId, PendingResult>,
}

impl PendingResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a result, replacing any previous one for the same ID.
    /// Empty results are dropped and `false` is returned.
    pub fn store(&mut self, result: PendingResult) -> bool {
        if result.is_empty() {
            return false;
        }
        self.results.insert(result.correlation_id.clone(), result);
        true
    }

    /// Removes and returns the result; a second take is `None`.
    pub fn take(&mut self, correlation_id: &CorrelationId) -> Option<PendingResult> {
        self.results.remove(correlation_id)
    }

    pub fn get(&self, correlation_id: &CorrelationId) -> Option<&PendingResult> {
        self.results.get(correlation_id)
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.results.contains_key(correlation_id)
    }

    /// Drops results older than `ttl` and returns them
    pub fn evict_expired(&mut self, now: Instant, ttl: Duration) -> Vec<PendingResult> {
        let expired: Vec<CorrelationId> = self
            .results
            .values()
            .filter(|result| now.saturating_duration_since(result.created_instant) >= ttl)
            .map(|result| result.correlation_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.results.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
