// src/placeholder.rs

//! Optimistic placeholders shown between dispatch and the first
//! authoritative answer

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::correlation::CorrelationId;
use crate::types::RequestKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceholderId(String);

impl PlaceholderId {
    fn generate(kind: &RequestKind) -> Self {
        Self(format!("temp-{}-{}", kind.id_prefix(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaceholderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provisional stand-in for an entity the backend has not confirmed yet.
/// Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct OptimisticPlaceholder {
    pub id: PlaceholderId,
    pub correlation_id: CorrelationId,
    pub kind: RequestKind,
    pub stub: Value,
    pub provisional: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    created_instant: Instant,
    #[serde(skip)]
    sequence: u64,
}

#[derive(Debug, Default)]
pub struct PlaceholderManager {
    by_correlation: HashMap<CorrelationId, OptimisticPlaceholder>,
    next_sequence: u64,
}

impl PlaceholderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the placeholder for `correlation_id`, replacing any earlier one
    pub fn create(
        &mut self,
        correlation_id: CorrelationId,
        kind: RequestKind,
        stub: Value,
    ) -> PlaceholderId {
        let id = PlaceholderId::generate(&kind);
        let placeholder = OptimisticPlaceholder {
            id: id.clone(),
            correlation_id: correlation_id.clone(),
            kind,
            stub,
            provisional: true,
            created_at: Utc::now(),
            created_instant: Instant::now(),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        if let Some(previous) = self.by_correlation.insert(correlation_id, placeholder) {
            tracing::warn!(
                correlation_id = %previous.correlation_id,
                placeholder_id = %previous.id,
                "Replaced existing optimistic placeholder"
            );
        }
        id
    }

    pub fn remove(&mut self, correlation_id: &CorrelationId) -> Option<OptimisticPlaceholder> {
        self.by_correlation.remove(correlation_id)
    }

    pub fn get(&self, correlation_id: &CorrelationId) -> Option<&OptimisticPlaceholder> {
        self.by_correlation.get(correlation_id)
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.by_correlation.contains_key(correlation_id)
    }

    /// Visible placeholders in creation order
    pub fn visible(&self) -> Vec<OptimisticPlaceholder> {
        let mut placeholders: Vec<OptimisticPlaceholder> =
            self.by_correlation.values().cloned().collect();
        placeholders.sort_by_key(|placeholder| placeholder.sequence);
        placeholders
    }

    /// Removes placeholders older than `max_age` and returns them
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> Vec<OptimisticPlaceholder> {
        let stale: Vec<CorrelationId> = self
            .by_correlation
            .values()
            .filter(|placeholder| {
                now.saturating_duration_since(placeholder.created_instant) >= max_age
            })
            .map(|placeholder| placeholder.correlation_id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| self.by_correlation.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_correlation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_correlation.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_and_remove() {
        let mut placeholders = PlaceholderManager::new();
        let id = placeholders.create(
            "c1".into(),
            RequestKind::UserMessage,
            json!({"question": "hi"}),
        );

        assert!(id.as_str().starts_with("temp-req-"));
        let placeholder = placeholders.get(&"c1".into()).unwrap();
        assert!(placeholder.provisional);
        assert_eq!(placeholder.stub["question"], "hi");

        assert!(placeholders.remove(&"c1".into()).is_some());
        assert!(placeholders.remove(&"c1".into()).is_none());
    }

    #[test]
    fn test_visible_in_creation_order() {
        let mut placeholders = PlaceholderManager::new();
        for id in ["a", "b", "c"] {
            placeholders.create(id.into(), RequestKind::UserMessage, json!({}));
        }
        let order: Vec<String> = placeholders
            .visible()
            .into_iter()
            .map(|p| p.correlation_id.into_inner())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_old_placeholders() {
        let mut placeholders = PlaceholderManager::new();
        placeholders.create("old".into(), RequestKind::UserMessage, json!({}));
        tokio::time::advance(Duration::from_secs(61)).await;
        placeholders.create("new".into(), RequestKind::UserMessage, json!({}));

        let expired = placeholders.expire(Instant::now(), Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert!(placeholders.contains(&"new".into()));
        assert!(!placeholders.contains(&"old".into()));
    }
}
