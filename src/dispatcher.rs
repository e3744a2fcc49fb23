// src/dispatcher.rs

//! Outbound half of a correlated operation
//!
//! Registration happens under the state lock; publishing happens after the
//! lock is released so a synchronous bus may deliver the response before
//! `send` returns.

use chrono::Utc;
use serde_json::{Map, Value};

use crate::bus::BusMessage;
use crate::config::CoordinationConfig;
use crate::correlation::{new_correlation_id, CorrelationId};
use crate::error::{Error, Result};
use crate::lifecycle::FailureReason;
use crate::reconcile::fail_pending;
use crate::registry::PendingRequest;
use crate::state::{CorrelationState, Settlement};
use crate::types::RequestKind;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub kind: RequestKind,
    pub payload: Value,
    pub recipient: String,
    /// Overrides the kind's default placeholder behaviour
    pub placeholder: Option<bool>,
    /// Renderable stub; derived from the payload when absent
    pub stub: Option<Value>,
    pub sender: Option<String>,
}

impl DispatchRequest {
    pub fn new(kind: RequestKind, payload: Value, recipient: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            recipient: recipient.into(),
            placeholder: None,
            stub: None,
            sender: None,
        }
    }

    pub fn with_placeholder(mut self, show: bool) -> Self {
        self.placeholder = Some(show);
        self
    }

    pub fn with_stub(mut self, stub: Value) -> Self {
        self.placeholder = Some(true);
        self.stub = Some(stub);
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn shows_placeholder(&self) -> bool {
        self.placeholder
            .unwrap_or_else(|| self.kind.shows_placeholder())
    }
}

/// Registers the operation and builds the message to publish
pub fn register(
    state: &mut CorrelationState,
    config: &CoordinationConfig,
    request: DispatchRequest,
) -> Result<(CorrelationId, BusMessage)> {
    if request.recipient.trim().is_empty() {
        return Err(Error::validation("recipient", "dispatch requires a recipient"));
    }

    let correlation_id = new_correlation_id(request.kind.id_prefix());

    let placeholder_id = if request.shows_placeholder() {
        let stub = request
            .stub
            .clone()
            .unwrap_or_else(|| placeholder_stub(&request.payload));
        Some(
            state
                .placeholders
                .create(correlation_id.clone(), request.kind.clone(), stub),
        )
    } else {
        None
    };

    let pending = PendingRequest::new(
        correlation_id.clone(),
        request.kind.clone(),
        request.recipient.clone(),
        placeholder_id,
    );
    if let Err(e) = state.registry.insert(pending) {
        state.placeholders.remove(&correlation_id);
        return Err(e);
    }
    state.lifecycle.begin(correlation_id.clone());
    state.stats.dispatched += 1;

    let sender = request
        .sender
        .unwrap_or_else(|| config.default_sender.clone());
    let message = BusMessage::new(
        request.kind.wire_type(),
        with_correlation_context(request.payload, &correlation_id),
    )
    .with_recipient(request.recipient)
    .with_correlation_id(correlation_id.clone())
    .with_sender(sender);

    tracing::debug!(
        %correlation_id,
        kind = %request.kind,
        recipient = ?message.recipient,
        "Registered dispatch"
    );
    Ok((correlation_id, message))
}

/// Undoes `register` after the bus refused the message
pub fn rollback(
    state: &mut CorrelationState,
    correlation_id: &CorrelationId,
    error: &Error,
) -> Option<Settlement> {
    let settlement = fail_pending(
        state,
        correlation_id,
        FailureReason::Transport,
        error.message.clone(),
    );
    if settlement.is_none() {
        // a re-entrant reply already settled the operation
        tracing::debug!(%correlation_id, "Nothing to roll back after publish failure");
    }
    settlement
}

/// Injects `context.correlationId` into object payloads
pub fn with_correlation_context(payload: Value, correlation_id: &CorrelationId) -> Value {
    let Value::Object(mut object) = payload else {
        return payload;
    };

    let context = object
        .entry("context")
        .or_insert_with(|| Value::Object(Map::new()));
    if context.is_null() {
        *context = Value::Object(Map::new());
    }
    match context {
        Value::Object(context) => {
            context.insert(
                "correlationId".to_string(),
                Value::String(correlation_id.to_string()),
            );
        }
        _ => {
            tracing::debug!(%correlation_id, "Payload context is not an object; left as is");
        }
    }
    Value::Object(object)
}

fn placeholder_stub(payload: &Value) -> Value {
    let mut stub = match payload {
        Value::Object(object) => object.clone(),
        other => {
            let mut object = Map::new();
            object.insert("value".to_string(), other.clone());
            object
        }
    };
    stub.remove("context");
    stub.entry("timestamp")
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
    stub.insert("isTemporary".to_string(), Value::Bool(true));
    Value::Object(stub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::OperationPhase;
    use serde_json::json;

    #[test]
    fn test_register_user_message() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);

        let request = DispatchRequest::new(
            RequestKind::UserMessage,
            json!({"message": "hi", "context": {"page": "chat"}}),
            "input",
        );
        let (id, message) = register(&mut state, &config, request).unwrap();

        assert!(id.as_str().starts_with("req-"));
        assert_eq!(message.message_type, "user_input");
        assert_eq!(message.payload["context"]["correlationId"], id.as_str());
        assert_eq!(message.payload["context"]["page"], "chat");
        assert_eq!(message.sender.as_deref(), Some("ui"));

        let placeholder = state.placeholders.get(&id).unwrap();
        assert_eq!(placeholder.stub["message"], "hi");
        assert_eq!(placeholder.stub["isTemporary"], true);
        assert!(placeholder.stub.get("context").is_none());
        assert_eq!(
            state.registry.get(&id).unwrap().placeholder_id.as_ref(),
            Some(&placeholder.id)
        );
        assert_eq!(state.lifecycle.phase(&id), Some(OperationPhase::Dispatched));
    }

    #[test]
    fn test_placeholder_override() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);

        let quiet = DispatchRequest::new(RequestKind::UserMessage, json!({}), "input")
            .with_placeholder(false);
        let (quiet_id, _) = register(&mut state, &config, quiet).unwrap();
        assert!(!state.placeholders.contains(&quiet_id));

        let loud = DispatchRequest::new(RequestKind::RuneInstall, json!({"rune": "r"}), "runes")
            .with_stub(json!({"name": "Installing"}));
        let (loud_id, message) = register(&mut state, &config, loud).unwrap();
        assert_eq!(state.placeholders.get(&loud_id).unwrap().stub["name"], "Installing");
        assert_eq!(message.message_type, "install_rune");
    }

    #[test]
    fn test_rollback_removes_everything() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        let request = DispatchRequest::new(RequestKind::UserMessage, json!({"message": "x"}), "input");
        let (id, _) = register(&mut state, &config, request).unwrap();

        let error = Error::transport(Some("input".into()), "no route");
        let settlement = rollback(&mut state, &id, &error).unwrap();
        assert_eq!(
            settlement.resolution.failure_reason(),
            Some(FailureReason::Transport)
        );
        assert!(state.is_untracked(&id));
        assert_eq!(state.stats.transport_failures, 1);
        assert!(rollback(&mut state, &id, &error).is_none());
    }

    #[test]
    fn test_empty_recipient_rejected() {
        let config = CoordinationConfig::default();
        let mut state = CorrelationState::new(&config);
        let request = DispatchRequest::new(RequestKind::GitSync, json!({}), " ");
        assert!(register(&mut state, &config, request).is_err());
        assert!(state.registry.is_empty());
    }

    #[test]
    fn test_non_object_payloads_pass_through() {
        let id = CorrelationId::from("c");
        assert_eq!(with_correlation_context(json!("raw"), &id), json!("raw"));
        assert_eq!(
            with_correlation_context(json!({"context": null}), &id),
            json!({"context": {"correlationId": "c"}})
        );
        assert_eq!(
            with_correlation_context(json!({"context": 5}), &id),
            json!({"context": 5})
        );
    }
}
