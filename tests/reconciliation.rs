// tests/reconciliation.rs

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use action_relay::bus::{BusMessage, LocalBus, MessageBus};
use action_relay::config::{BusConfig, CoordinationConfig};
use action_relay::lifecycle::OperationPhase;
use action_relay::{
    CoordinationManager, CorrelationId, EntityKind, FailureReason, Manager, RequestKind, Result,
};

struct Harness {
    bus: Arc<LocalBus>,
    outbox: Arc<Mutex<Vec<BusMessage>>>,
    coordinator: CoordinationManager,
}

impl Harness {
    async fn start(config: CoordinationConfig) -> Self {
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

        let mut coordinator = CoordinationManager::new(config, BusConfig::default(), bus.clone());
        coordinator.initialize().await.unwrap();
        Self {
            bus,
            outbox,
            coordinator,
        }
    }

    fn dispatch(&self, message: &str) -> CorrelationId {
        self.coordinator
            .dispatch(RequestKind::UserMessage, json!({"message": message}), "input")
            .unwrap()
    }

    fn respond(&self, id: &CorrelationId, data: Option<Value>) {
        let mut payload = json!({"success": true});
        if let Some(data) = data {
            payload["data"] = data;
        }
        self.bus
            .send(BusMessage::new("agent_response", payload).with_correlation_id(id.clone()))
            .unwrap();
    }

    fn fail(&self, id: &CorrelationId, error: &str) {
        self.bus
            .send(
                BusMessage::new("agent_response", json!({"success": false, "error": error}))
                    .with_correlation_id(id.clone()),
            )
            .unwrap();
    }

    fn persist(&self, entity_id: &str, id: Option<&CorrelationId>) {
        let mut record = json!({
            "id": entity_id,
            "question": "hello",
            "timestamp": "2026-01-01T00:00:00Z",
        });
        if let Some(id) = id {
            record["dev_log_details"] = json!({"correlationId": id.as_str()});
        }
        self.bus
            .send(BusMessage::new("knowledge_record_insert", record))
            .unwrap();
    }
}

fn decision(value: &str) -> Value {
    json!({"decision": value, "relevantKnowledge": [{"id": "kb-1"}]})
}

#[tokio::test]
async fn test_notification_before_response_is_patched_late() {
    let harness = Harness::start(CoordinationConfig::default()).await;
    let id = harness.dispatch("first");
    let waiter = harness.coordinator.resolution_of(&id).unwrap();

    harness.persist("r1", Some(&id));
    let entity = harness.coordinator.entity_for(&id).unwrap();
    assert!(entity.decision.is_none());
    assert!(harness.coordinator.placeholders().is_empty());

    harness.respond(&id, Some(decision("D")));
    let entity = harness.coordinator.entity("r1").unwrap();
    assert_eq!(entity.decision, Some(json!("D")));
    assert_eq!(entity.auxiliary, Some(json!([{"id": "kb-1"}])));

    assert!(waiter.await.unwrap().is_success());
    assert!(harness.coordinator.is_untracked(&id));
    assert_eq!(harness.coordinator.stats().late_patches, 1);
}

#[tokio::test]
async fn test_response_before_notification_is_merged() {
    let harness = Harness::start(CoordinationConfig::default()).await;
    let id = harness.dispatch("second");

    harness.respond(&id, Some(decision("D2")));
    assert!(!harness.coordinator.is_pending(&id));
    assert_eq!(
        harness.coordinator.phase(&id),
        Some(OperationPhase::AwaitingNotification)
    );
    assert!(harness.coordinator.placeholders().is_empty());

    harness.persist("r2", Some(&id));
    let entity = harness.coordinator.entity("r2").unwrap();
    assert_eq!(entity.decision, Some(json!("D2")));
    assert!(harness.coordinator.is_untracked(&id));

    // at-least-once delivery: the replay changes nothing
    harness.persist("r2", Some(&id));
    assert_eq!(harness.coordinator.entity("r2").unwrap().decision, Some(json!("D2")));
    let stats = harness.coordinator.stats();
    assert_eq!(stats.merges, 1);
    assert_eq!(stats.duplicate_notifications, 1);
}

#[tokio::test]
async fn test_response_without_data_skips_cache() {
    let harness = Harness::start(CoordinationConfig::default()).await;
    let id = harness.dispatch("third");

    harness.respond(&id, None);
    assert!(harness.coordinator.is_untracked(&id));
    assert_eq!(harness.coordinator.stats().pending_results, 0);

    harness.persist("r3", Some(&id));
    let entity = harness.coordinator.entity("r3").unwrap();
    assert!(entity.decision.is_none());
    assert_eq!(harness.coordinator.stats().merges, 0);
    assert!(harness.coordinator.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_backend_times_out() {
    let config = CoordinationConfig {
        request_timeout_ms: 1_000,
        sweep_interval_ms: 100,
        ..CoordinationConfig::default()
    };
    let harness = Harness::start(config).await;
    let id = harness.dispatch("fourth");
    let waiter = harness.coordinator.resolution_of(&id).unwrap();
    assert_eq!(harness.coordinator.placeholders().len(), 1);

    tokio::time::sleep(Duration::from_millis(1_250)).await;

    let resolution = waiter.await.unwrap();
    assert_eq!(resolution.failure_reason(), Some(FailureReason::Timeout));
    assert!(harness.coordinator.is_untracked(&id));
    assert!(harness.coordinator.placeholders().is_empty());
    let notices = harness.coordinator.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].reason, FailureReason::Timeout);

    // a reply after the timeout is stale
    harness.respond(&id, Some(decision("late")));
    assert_eq!(harness.coordinator.stats().stale_events, 1);
}

#[tokio::test]
async fn test_concurrent_dispatches_are_independent() {
    let harness = Harness::start(CoordinationConfig::default()).await;
    let first = harness.dispatch("a");
    let second = harness.dispatch("b");
    assert_ne!(first, second);
    assert_eq!(harness.outbox.lock().len(), 2);
    assert_eq!(harness.coordinator.placeholders().len(), 2);

    harness.fail(&first, "rejected");

    assert!(harness.coordinator.is_untracked(&first));
    assert!(harness.coordinator.is_pending(&second));
    assert_eq!(harness.coordinator.placeholders().len(), 1);
    assert_eq!(
        harness.coordinator.placeholders()[0].correlation_id,
        second
    );
    let notices = harness.coordinator.notices();
    assert_eq!(notices[0].reason, FailureReason::Backend);
    assert_eq!(notices[0].message, "rejected");
}

#[tokio::test]
async fn test_stale_and_unrelated_events_are_harmless() {
    let harness = Harness::start(CoordinationConfig::default()).await;
    let id = harness.dispatch("pending");

    harness.respond(&CorrelationId::from("unknown"), Some(decision("x")));
    harness.persist("other", None);

    assert!(harness.coordinator.is_pending(&id));
    assert_eq!(harness.coordinator.entities(EntityKind::ConversationRecord).len(), 1);
    assert!(harness.coordinator.entity("other").unwrap().correlation_id.is_none());
    assert_eq!(harness.coordinator.stats().stale_events, 1);
    assert!(harness.coordinator.notices().is_empty());
}

#[tokio::test]
async fn test_delete_notification_removes_entity() {
    let harness = Harness::start(CoordinationConfig::default()).await;
    harness.persist("gone", None);
    assert!(harness.coordinator.entity("gone").is_some());

    harness
        .bus
        .send(BusMessage::new("knowledge_record_delete", json!({"id": "gone"})))
        .unwrap();
    assert!(harness.coordinator.entity("gone").is_none());
}

#[tokio::test]
async fn test_ambient_updates_reach_session_state() {
    let harness = Harness::start(CoordinationConfig::default()).await;
    harness
        .bus
        .send(BusMessage::new(
            "suggestion_update",
            json!({"suggestions": ["try this"], "isLoadingSuggestions": false}),
        ))
        .unwrap();

    let ambient = harness.coordinator.ambient();
    assert_eq!(ambient.suggestions, vec![json!("try this")]);
    assert_eq!(harness.coordinator.stats().ambient_updates, 1);
}
