// src/view.rs

//! Caller-visible projection of persisted entities
//!
//! The view holds the latest authoritative record per entity, the
//! decision/auxiliary data merged onto it, an index from correlation ID to
//! entity ID (used to patch an entity whose direct response arrives late),
//! and a bounded list of user-visible failure notices.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::correlation::CorrelationId;
use crate::error::{Error, Result};
use crate::lifecycle::FailureReason;
use crate::placeholder::OptimisticPlaceholder;
use crate::types::{EntityKind, RequestKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub id: String,
    pub kind: EntityKind,
    pub data: Value,
    pub correlation_id: Option<CorrelationId>,
    pub decision: Option<Value>,
    pub auxiliary: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    fn sort_key(&self) -> (String, String) {
        let timestamp = self
            .data
            .get("timestamp")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        (timestamp, self.id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// User-visible failure tied to one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureNotice {
    pub correlation_id: CorrelationId,
    pub kind: RequestKind,
    pub reason: FailureReason,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// What a page renders: confirmed entities and provisional placeholders
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum VisibleEntry {
    Entity(EntityRecord),
    Placeholder(OptimisticPlaceholder),
}

impl VisibleEntry {
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Entity(record) => record.correlation_id.as_ref(),
            Self::Placeholder(placeholder) => Some(&placeholder.correlation_id),
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }
}

/// Extracts a record's permanent identifier (string or number)
pub fn entity_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[derive(Debug)]
pub struct EntityView {
    entities: HashMap<String, EntityRecord>,
    by_correlation: HashMap<CorrelationId, String>,
    notices: VecDeque<FailureNotice>,
    notice_capacity: usize,
}

impl EntityView {
    pub fn new(notice_capacity: usize) -> Self {
        Self {
            entities: HashMap::new(),
            by_correlation: HashMap::new(),
            notices: VecDeque::new(),
            notice_capacity: notice_capacity.max(1),
        }
    }

    /// Inserts or replaces the record while keeping merged data.
    ///
    /// Re-delivering identical data is `Unchanged` and touches nothing. When
    /// several records carry one correlation ID, the first one indexed stays
    /// its target until it is removed.
    pub fn upsert(
        &mut self,
        kind: EntityKind,
        record: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(String, UpsertOutcome)> {
        let id = entity_id(&record)
            .ok_or_else(|| Error::validation("id", "persisted record has no usable id"))?;

        let outcome = match self.entities.get_mut(&id) {
            Some(existing) => {
                let correlation_id = correlation_id.or_else(|| existing.correlation_id.clone());
                if existing.data == record && existing.correlation_id == correlation_id {
                    UpsertOutcome::Unchanged
                } else {
                    if let Some(previous) = existing.correlation_id.take() {
                        if Some(&previous) != correlation_id.as_ref()
                            && self.by_correlation.get(&previous) == Some(&id)
                        {
                            self.by_correlation.remove(&previous);
                        }
                    }
                    existing.data = record;
                    existing.kind = kind;
                    existing.correlation_id = correlation_id.clone();
                    existing.updated_at = Utc::now();
                    if let Some(correlation_id) = correlation_id {
                        self.by_correlation
                            .entry(correlation_id)
                            .or_insert_with(|| id.clone());
                    }
                    UpsertOutcome::Updated
                }
            }
            None => {
                if let Some(correlation_id) = &correlation_id {
                    self.by_correlation
                        .entry(correlation_id.clone())
                        .or_insert_with(|| id.clone());
                }
                self.entities.insert(
                    id.clone(),
                    EntityRecord {
                        id: id.clone(),
                        kind,
                        data: record,
                        correlation_id,
                        decision: None,
                        auxiliary: None,
                        updated_at: Utc::now(),
                    },
                );
                UpsertOutcome::Inserted
            }
        };

        Ok((id, outcome))
    }

    pub fn remove(&mut self, id: &str) -> Option<EntityRecord> {
        let removed = self.entities.remove(id)?;
        if let Some(correlation_id) = &removed.correlation_id {
            if self.by_correlation.get(correlation_id).map(String::as_str) == Some(id) {
                self.by_correlation.remove(correlation_id);
            }
        }
        Some(removed)
    }

    /// Attaches decision/auxiliary data to the entity with `id`. Fields that
    /// are `None` keep their current value.
    pub fn attach(&mut self, id: &str, decision: Option<Value>, auxiliary: Option<Value>) -> bool {
        let Some(record) = self.entities.get_mut(id) else {
            return false;
        };
        if decision.is_some() {
            record.decision = decision;
        }
        if auxiliary.is_some() {
            record.auxiliary = auxiliary;
        }
        record.updated_at = Utc::now();
        true
    }

    pub fn id_for(&self, correlation_id: &CorrelationId) -> Option<&str> {
        self.by_correlation.get(correlation_id).map(String::as_str)
    }

    pub fn by_correlation(&self, correlation_id: &CorrelationId) -> Option<&EntityRecord> {
        self.id_for(correlation_id)
            .and_then(|id| self.entities.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.entities.get(id)
    }

    /// Records of one kind ordered by their `timestamp` field, then ID
    pub fn of_kind(&self, kind: EntityKind) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = self
            .entities
            .values()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect();
        records.sort_by_key(EntityRecord::sort_key);
        records
    }

    pub fn all(&self) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = self.entities.values().cloned().collect();
        records.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.sort_key().cmp(&b.sort_key())));
        records
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn push_notice(&mut self, notice: FailureNotice) {
        while self.notices.len() >= self.notice_capacity {
            self.notices.pop_front();
        }
        self.notices.push_back(notice);
    }

    pub fn notices(&self) -> Vec<FailureNotice> {
        self.notices.iter().cloned().collect()
    }

    pub fn clear_notices(&mut self) {
        self.notices.clear();
    }
}
