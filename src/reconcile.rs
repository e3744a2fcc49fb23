// src/reconcile.rs

//! Merge, cache and discard decisions for inbound events
//!
//! A correlated operation can surface as a direct response, as a
//! persisted-entity notification, or as both in either order. The two entry
//! points below converge on the same final view:
//!
//! - response first: the decision/auxiliary fragment is cached and merged
//!   when the entity's notification arrives;
//! - notification first: the entity is indexed by correlation ID and the
//!   fragment is patched onto it when the response arrives.
//!
//! Both functions run under the coordinator's state lock and hand back any
//! [`Settlement`] for delivery after the lock is released.

use serde_json::Value;

use crate::bus::BusMessage;
use crate::config::CoordinationConfig;
use crate::correlation::CorrelationId;
use crate::error::{Error, Result};
use crate::lifecycle::{FailureReason, LifecycleEvent, Resolution};
use crate::result_cache::PendingResult;
use crate::state::{CorrelationState, Settlement};
use crate::types::{EntityChange, EntityKind};
use crate::view::{entity_id, FailureNotice, UpsertOutcome};

const DEFAULT_FAILURE_MESSAGE: &str = "The request could not be completed";

#[derive(Debug, Clone, PartialEq)]
pub struct DirectResponse {
    pub correlation_id: CorrelationId,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub sender: Option<String>,
}

impl DirectResponse {
    /// Reads the `{success, data, error}` payload of a direct response
    pub fn from_message(message: &BusMessage) -> Result<Self> {
        let correlation_id = message
            .correlation()
            .ok_or_else(|| Error::validation("correlationId", "direct response without correlation ID"))?;

        let payload = &message.payload;
        if !payload.is_object() {
            return Err(Error::validation("payload", "direct response payload is not an object")
                .correlation_id(correlation_id));
        }

        let error = match payload.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => Some(
                other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            ),
        };
        let success = payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(error.is_none());
        let data = payload.get("data").filter(|data| !data.is_null()).cloned();

        Ok(Self {
            correlation_id,
            success,
            data,
            error,
            sender: message.sender.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedNotification {
    pub kind: EntityKind,
    pub change: EntityChange,
    pub record: Value,
}

impl PersistedNotification {
    pub fn new(kind: EntityKind, change: EntityChange, record: Value) -> Self {
        Self { kind, change, record }
    }

    /// Correlation ID embedded in the record at `pointer`
    pub fn correlation_id(&self, pointer: &str) -> Option<CorrelationId> {
        self.record
            .pointer(pointer)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(CorrelationId::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// No pending request; nothing changed
    Stale,
    Failed,
    /// Fragment cached until the entity's notification arrives
    Cached,
    /// Fragment attached to an entity that was already in the view
    LatePatched,
    /// Nothing to merge
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationOutcome {
    Deleted,
    /// Delete for an entity the view never held
    Absent,
    Merged,
    Upserted(UpsertOutcome),
}

pub fn on_direct_response(
    state: &mut CorrelationState,
    config: &CoordinationConfig,
    response: DirectResponse,
) -> (ResponseOutcome, Option<Settlement>) {
    let correlation_id = response.correlation_id;

    let Some(request) = state.registry.remove(&correlation_id) else {
        state.stats.stale_events += 1;
        let error = Error::stale_event(correlation_id);
        tracing::debug!(
            error = %error,
            sender = ?response.sender,
            "Dropping direct response with no pending request"
        );
        return (ResponseOutcome::Stale, None);
    };
    state.stats.direct_responses += 1;

    if state.placeholders.remove(&correlation_id).is_some() {
        tracing::trace!(%correlation_id, "Retired placeholder on direct response");
    }

    if !response.success {
        let message = response
            .error
            .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string());
        state.results.take(&correlation_id);
        advance(state, &correlation_id, LifecycleEvent::ResponseFailed);
        state.stats.backend_failures += 1;
        state.view.push_notice(FailureNotice {
            correlation_id: correlation_id.clone(),
            kind: request.kind.clone(),
            reason: FailureReason::Backend,
            message: message.clone(),
            at: chrono::Utc::now(),
        });
        let error = Error::backend(Some(request.recipient.clone()), message.clone())
            .correlation_id(correlation_id.clone());
        tracing::warn!(
            kind = %request.kind,
            error = %error,
            "Backend reported failure"
        );

        let resolution =
            Resolution::failed(correlation_id, request.kind, FailureReason::Backend, message);
        return (ResponseOutcome::Failed, Some(state.settle(resolution)));
    }

    let decision = field(response.data.as_ref(), &config.decision_field);
    let auxiliary = field(response.data.as_ref(), &config.auxiliary_field);

    let outcome = if decision.is_none() && auxiliary.is_none() {
        advance(state, &correlation_id, LifecycleEvent::ResponseSettled);
        ResponseOutcome::Settled
    } else if let Some(entity_id) = state.view.id_for(&correlation_id).map(str::to_string) {
        state.view.attach(&entity_id, decision, auxiliary);
        advance(state, &correlation_id, LifecycleEvent::ResponseSettled);
        state.stats.late_patches += 1;
        tracing::debug!(%correlation_id, %entity_id, "Patched entity with late response data");
        ResponseOutcome::LatePatched
    } else {
        state
            .results
            .store(PendingResult::new(correlation_id.clone(), decision, auxiliary));
        advance(state, &correlation_id, LifecycleEvent::ResponseWithPendingData);
        tracing::debug!(%correlation_id, "Cached response data until the entity is persisted");
        ResponseOutcome::Cached
    };

    tracing::debug!(
        %correlation_id,
        kind = %request.kind,
        outcome = ?outcome,
        "Direct response reconciled"
    );
    let resolution = Resolution::succeeded(correlation_id, request.kind, response.data);
    (outcome, Some(state.settle(resolution)))
}

pub fn on_persisted_notification(
    state: &mut CorrelationState,
    config: &CoordinationConfig,
    notification: PersistedNotification,
) -> Result<NotificationOutcome> {
    state.stats.notifications += 1;

    if notification.change == EntityChange::Delete {
        let id = entity_id(&notification.record)
            .ok_or_else(|| Error::validation("id", "delete notification without an entity id"))?;
        return Ok(match state.view.remove(&id) {
            Some(_) => {
                tracing::debug!(entity_id = %id, kind = ?notification.kind, "Entity deleted");
                NotificationOutcome::Deleted
            }
            None => NotificationOutcome::Absent,
        });
    }

    let correlation_id = notification.correlation_id(&config.correlation_pointer);
    let (id, upsert) = state
        .view
        .upsert(notification.kind, notification.record, correlation_id.clone())?;

    if let Some(correlation_id) = &correlation_id {
        if state.placeholders.remove(correlation_id).is_some() {
            tracing::trace!(%correlation_id, entity_id = %id, "Persisted entity replaced placeholder");
        }

        if let Some(result) = state.results.take(correlation_id) {
            state.view.attach(&id, result.decision, result.auxiliary);
            advance(state, correlation_id, LifecycleEvent::NotificationMerged);
            state.stats.merges += 1;
            tracing::debug!(%correlation_id, entity_id = %id, "Merged cached response data");
            return Ok(NotificationOutcome::Merged);
        }
    }

    if upsert == UpsertOutcome::Unchanged {
        state.stats.duplicate_notifications += 1;
        tracing::trace!(entity_id = %id, "Duplicate notification ignored");
    }
    Ok(NotificationOutcome::Upserted(upsert))
}

/// Removes every fragment of a pending operation and resolves it as failed.
///
/// Returns `None` when nothing was pending.
pub fn fail_pending(
    state: &mut CorrelationState,
    correlation_id: &CorrelationId,
    reason: FailureReason,
    message: impl Into<String>,
) -> Option<Settlement> {
    let request = state.registry.remove(correlation_id)?;
    state.placeholders.remove(correlation_id);
    state.results.take(correlation_id);

    let event = match reason {
        FailureReason::Timeout => LifecycleEvent::Expired,
        FailureReason::Cancelled => LifecycleEvent::Cancelled,
        FailureReason::Transport => LifecycleEvent::TransportFailed,
        FailureReason::Backend => LifecycleEvent::ResponseFailed,
    };
    advance(state, correlation_id, event);

    let message = message.into();
    let error = reason
        .error(Some(request.recipient.clone()), message.clone())
        .correlation_id(correlation_id.clone());
    tracing::debug!(kind = %request.kind, error = %error, "Pending operation failed");
    match reason {
        FailureReason::Timeout => state.stats.timeouts += 1,
        FailureReason::Cancelled => state.stats.cancelled += 1,
        FailureReason::Transport => state.stats.transport_failures += 1,
        FailureReason::Backend => state.stats.backend_failures += 1,
    }
    if reason != FailureReason::Cancelled {
        state.view.push_notice(FailureNotice {
            correlation_id: correlation_id.clone(),
            kind: request.kind.clone(),
            reason,
            message: message.clone(),
            at: chrono::Utc::now(),
        });
    }

    let resolution = Resolution::failed(correlation_id.clone(), request.kind, reason, message);
    Some(state.settle(resolution))
}

fn field(data: Option<&Value>, name: &str) -> Option<Value> {
    data?.get(name).filter(|value| !value.is_null()).cloned()
}

pub(crate) fn advance(state: &mut CorrelationState, correlation_id: &CorrelationId, event: LifecycleEvent) {
    match state.lifecycle.apply(correlation_id, event) {
        Some(Ok(phase)) => {
            tracing::trace!(%correlation_id, %phase, "Lifecycle advanced");
        }
        Some(Err(e)) => {
            tracing::warn!(%correlation_id, error = %e, "Ignored lifecycle event");
        }
        None => {
            tracing::trace!(%correlation_id, ?event, "No lifecycle entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::OperationPhase;
    use crate::registry::PendingRequest;
    use crate::types::RequestKind;
    use serde_json::json;

    fn pending(state: &mut CorrelationState, id: &str, placeholder: bool) -> CorrelationId {
        let correlation_id = CorrelationId::from(id);
        let placeholder_id = placeholder.then(|| {
            state.placeholders.create(
                correlation_id.clone(),
                RequestKind::UserMessage,
                json!({"question": "q"}),
            )
        });
        state
            .registry
            .insert(PendingRequest::new(
                correlation_id.clone(),
                RequestKind::UserMessage,
                "input",
                placeholder_id,
            ))
            .unwrap();
        state.lifecycle.begin(correlation_id.clone());
        correlation_id
    }

    fn response(id: &CorrelationId, data: Value) -> DirectResponse {
        DirectResponse {
            correlation_id: id.clone(),
            success: true,
            data: Some(data),
            error: None,
            sender: None,
        }
    }

    fn record(entity: &str, correlation: &str) -> PersistedNotification {
        PersistedNotification::new(
            EntityKind::ConversationRecord,
            EntityChange::Insert,
            json!({
                "id": entity,
                "answer": "hello",
                "dev_log_details": {"correlationId": correlation},
            }),
        )
    }

    #[test]
    fn test_response_then_notification_merges() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        let id = pending(&mut state, "c2", true);

        let (outcome, settlement) =
            on_direct_response(&mut state, &config, response(&id, json!({"decision": {"a": 1}})));
        assert_eq!(outcome, ResponseOutcome::Cached);
        assert!(settlement.unwrap().resolution.is_success());
        assert!(!state.placeholders.contains(&id));
        assert_eq!(state.lifecycle.phase(&id), Some(OperationPhase::AwaitingNotification));

        let outcome = on_persisted_notification(&mut state, &config, record("m1", "c2")).unwrap();
        assert_eq!(outcome, NotificationOutcome::Merged);
        assert_eq!(state.view.get("m1").unwrap().decision, Some(json!({"a": 1})));
        assert!(state.is_untracked(&id));
    }

    #[test]
    fn test_notification_then_response_patches() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        let id = pending(&mut state, "c1", true);

        let outcome = on_persisted_notification(&mut state, &config, record("m1", "c1")).unwrap();
        assert_eq!(outcome, NotificationOutcome::Upserted(UpsertOutcome::Inserted));
        assert!(!state.placeholders.contains(&id));
        assert!(state.registry.contains(&id));

        let (outcome, _) = on_direct_response(
            &mut state,
            &config,
            response(&id, json!({"relevantKnowledge": [1, 2]})),
        );
        assert_eq!(outcome, ResponseOutcome::LatePatched);
        assert_eq!(state.view.get("m1").unwrap().auxiliary, Some(json!([1, 2])));
        assert!(state.is_untracked(&id));
    }

    #[test]
    fn test_shared_correlation_targets_first_record() {
        let task = |correlation: &str| {
            PersistedNotification::new(
                EntityKind::Task,
                EntityChange::Insert,
                json!({"id": "task-1", "dev_log_details": {"correlationId": correlation}}),
            )
        };
        let step = |correlation: &str| {
            PersistedNotification::new(
                EntityKind::TaskStep,
                EntityChange::Insert,
                json!({"id": "step-1", "dev_log_details": {"correlationId": correlation}}),
            )
        };
        let config = CoordinationConfig::default();

        let mut decisions = Vec::new();
        for response_first in [true, false] {
            let mut state = CorrelationState::new(&config);
            let id = pending(&mut state, "c4", false);
            if response_first {
                on_direct_response(&mut state, &config, response(&id, json!({"decision": "D"})));
            }
            on_persisted_notification(&mut state, &config, task("c4")).unwrap();
            on_persisted_notification(&mut state, &config, step("c4")).unwrap();
            if !response_first {
                on_direct_response(&mut state, &config, response(&id, json!({"decision": "D"})));
            }
            assert!(state.is_untracked(&id));
            decisions.push((
                state.view.get("task-1").unwrap().decision.clone(),
                state.view.get("step-1").unwrap().decision.clone(),
            ));
        }

        assert_eq!(decisions[0], (Some(json!("D")), None));
        assert_eq!(decisions[0], decisions[1]);
    }

    #[test]
    fn test_failed_response_cleans_up() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        let id = pending(&mut state, "c3", true);

        let failure = DirectResponse {
            correlation_id: id.clone(),
            success: false,
            data: None,
            error: Some("engine down".into()),
            sender: Some("input".into()),
        };
        let (outcome, settlement) = on_direct_response(&mut state, &config, failure);

        assert_eq!(outcome, ResponseOutcome::Failed);
        let resolution = settlement.unwrap().resolution;
        assert_eq!(resolution.failure_reason(), Some(FailureReason::Backend));
        assert!(state.is_untracked(&id));
        assert_eq!(state.view.notices()[0].message, "engine down");
    }

    #[test]
    fn test_stale_response_mutates_nothing() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);

        let (outcome, settlement) =
            on_direct_response(&mut state, &config, response(&"ghost".into(), json!({"decision": 1})));
        assert_eq!(outcome, ResponseOutcome::Stale);
        assert!(settlement.is_none());
        assert!(state.results.is_empty());
        assert_eq!(state.stats.stale_events, 1);
    }

    #[test]
    fn test_duplicate_notification_is_idempotent() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        let id = pending(&mut state, "c4", false);
        on_direct_response(&mut state, &config, response(&id, json!({"decision": "x"})));
        on_persisted_notification(&mut state, &config, record("m4", "c4")).unwrap();
        let merged = state.view.get("m4").unwrap().clone();

        let outcome = on_persisted_notification(&mut state, &config, record("m4", "c4")).unwrap();
        assert_eq!(outcome, NotificationOutcome::Upserted(UpsertOutcome::Unchanged));
        assert_eq!(state.view.get("m4").unwrap(), &merged);
    }

    #[test]
    fn test_response_without_fragment_settles() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        let id = pending(&mut state, "c5", false);

        let (outcome, _) = on_direct_response(&mut state, &config, response(&id, json!({"ok": true})));
        assert_eq!(outcome, ResponseOutcome::Settled);
        assert!(state.is_untracked(&id));
    }

    #[test]
    fn test_delete_and_missing_ids() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        on_persisted_notification(&mut state, &config, record("m9", "")).unwrap();

        let delete = PersistedNotification::new(
            EntityKind::ConversationRecord,
            EntityChange::Delete,
            json!({"id": "m9"}),
        );
        assert_eq!(
            on_persisted_notification(&mut state, &config, delete.clone()).unwrap(),
            NotificationOutcome::Deleted
        );
        assert_eq!(
            on_persisted_notification(&mut state, &config, delete).unwrap(),
            NotificationOutcome::Absent
        );

        let no_id = PersistedNotification::new(EntityKind::Task, EntityChange::Update, json!({}));
        assert!(on_persisted_notification(&mut state, &config, no_id).is_err());
    }

    #[test]
    fn test_fail_pending_for_each_reason() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        let id = pending(&mut state, "c6", true);

        let settlement = fail_pending(&mut state, &id, FailureReason::Timeout, "late").unwrap();
        assert_eq!(settlement.resolution.failure_reason(), Some(FailureReason::Timeout));
        assert!(state.is_untracked(&id));
        assert_eq!(state.stats.timeouts, 1);
        assert!(fail_pending(&mut state, &id, FailureReason::Cancelled, "again").is_none());
    }

    #[test]
    fn test_parse_direct_response() {
        let message = BusMessage::new(
            "agent_response",
            json!({"success": false, "error": {"message": "quota exceeded"}}),
        )
        .with_correlation_id("c7".into());
        let parsed = DirectResponse::from_message(&message).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_deref(), Some("quota exceeded"));

        let implicit = BusMessage::new("agent_response", json!({"correlationId": "c8", "data": {}}));
        assert!(DirectResponse::from_message(&implicit).unwrap().success);

        let anonymous = BusMessage::new("agent_response", json!({"success": true}));
        assert!(DirectResponse::from_message(&anonymous).is_err());
    }
}
