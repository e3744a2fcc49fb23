// src/registry.rs

//! Pending request registry: the source of truth for "is this operation
//! still outstanding"

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::correlation::CorrelationId;
use crate::error::{Error, ErrorKind, Result};
use crate::placeholder::PlaceholderId;
use crate::types::RequestKind;

/// Metadata for one in-flight request
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub correlation_id: CorrelationId,
    pub kind: RequestKind,
    pub recipient: String,
    pub dispatched_at: DateTime<Utc>,
    #[serde(skip)]
    pub dispatched_instant: Instant,
    pub placeholder_id: Option<PlaceholderId>,
}

impl PendingRequest {
    pub fn new(
        correlation_id: CorrelationId,
        kind: RequestKind,
        recipient: impl Into<String>,
        placeholder_id: Option<PlaceholderId>,
    ) -> Self {
        Self {
            correlation_id,
            kind,
            recipient: recipient.into(),
            dispatched_at: Utc::now(),
            dispatched_instant: Instant::now(),
            placeholder_id,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.dispatched_instant)
    }
}

#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    requests: HashMap<CorrelationId, PendingRequest>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request; an ID that is still pending is never reused.
    pub fn insert(&mut self, request: PendingRequest) -> Result<()> {
        if self.requests.contains_key(&request.correlation_id) {
            return Err(Error::new(
                ErrorKind::Validation {
                    field: Some("correlation_id".to_string()),
                    rules: vec!["unique_while_pending".to_string()],
                },
                format!(
                    "correlation id {} is already pending",
                    request.correlation_id
                ),
            )
            .correlation_id(request.correlation_id.clone()));
        }
        self.requests
            .insert(request.correlation_id.clone(), request);
        Ok(())
    }

    pub fn remove(&mut self, correlation_id: &CorrelationId) -> Option<PendingRequest> {
        self.requests.remove(correlation_id)
    }

    pub fn get(&self, correlation_id: &CorrelationId) -> Option<&PendingRequest> {
        self.requests.get(correlation_id)
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.requests.contains_key(correlation_id)
    }

    /// IDs of requests dispatched at least `timeout` before `now`, oldest first
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<CorrelationId> {
        let mut expired: Vec<&PendingRequest> = self
            .requests
            .values()
            .filter(|request| request.age(now) >= timeout)
            .collect();
        expired.sort_by_key(|request| request.dispatched_instant);
        expired
            .into_iter()
            .map(|request| request.correlation_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<PendingRequest> = self.requests.values().cloned().collect();
        requests.sort_by_key(|request| request.dispatched_instant);
        requests
    }
}
