// src/simulation.rs

//! Scripted stand-in for a backend worker
//!
//! [`ScriptedBackend`] is registered as a bus route. For every message it
//! receives it plays the next [`Script`]: a direct response and/or a
//! persisted-entity notification echoing the correlation ID, in a chosen
//! order, a failure, or nothing at all.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::bus::{BusMessage, MessageBus, Route};
use crate::config::{BusConfig, CoordinationConfig};
use crate::coordinator::CoordinationManager;
use crate::correlation::CorrelationId;
use crate::error::{Error, Result};
use crate::lifecycle::Resolution;
use crate::state::RelayStats;
use crate::types::{EntityChange, EntityKind, RequestKind};
use crate::view::{FailureNotice, VisibleEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Script {
    /// Direct response, then the persisted notification
    ResponseFirst,
    /// Persisted notification, then the direct response
    NotificationFirst,
    /// Direct response with merge-worthy data and no notification
    ResponseOnly,
    /// Persisted notification only
    NotificationOnly,
    /// `success: false` response
    Fail { message: String },
    /// Never answers
    Silent,
}

impl Script {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResponseFirst => "response_first",
            Self::NotificationFirst => "notification_first",
            Self::ResponseOnly => "response_only",
            Self::NotificationOnly => "notification_only",
            Self::Fail { .. } => "fail",
            Self::Silent => "silent",
        }
    }
}

pub struct ScriptedBackend {
    bus: Weak<dyn MessageBus>,
    bus_config: BusConfig,
    correlation_pointer: String,
    entity_kind: EntityKind,
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    delay: Option<Duration>,
    received: Mutex<Vec<BusMessage>>,
    sequence: AtomicU64,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("entity_kind", &self.entity_kind)
            .field("queued", &self.scripts.lock().len())
            .field("fallback", &self.fallback)
            .field("delay", &self.delay)
            .finish()
    }
}

impl ScriptedBackend {
    pub fn new(bus: Weak<dyn MessageBus>, bus_config: BusConfig, coordination: &CoordinationConfig) -> Self {
        Self {
            bus,
            bus_config,
            correlation_pointer: coordination.correlation_pointer.clone(),
            entity_kind: EntityKind::ConversationRecord,
            scripts: Mutex::new(VecDeque::new()),
            fallback: Script::ResponseFirst,
            delay: None,
            received: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_entity_kind(mut self, kind: EntityKind) -> Self {
        self.entity_kind = kind;
        self
    }

    /// Script played once the queue is empty
    pub fn with_fallback(mut self, script: Script) -> Self {
        self.fallback = script;
        self
    }

    /// Answers from a spawned task after `delay` instead of inline
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn enqueue(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn received(&self) -> Vec<BusMessage> {
        self.received.lock().clone()
    }

    fn next_script(&self) -> Script {
        self.scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn plan(&self, script: &Script, request: &BusMessage, correlation_id: &CorrelationId) -> Vec<BusMessage> {
        let entity_id = format!(
            "{}-{}",
            self.entity_kind.event_prefix(),
            self.sequence.fetch_add(1, Ordering::Relaxed) + 1
        );

        let response = |data: Value| {
            BusMessage::new(
                self.bus_config.direct_response_event.clone(),
                json!({"success": true, "data": data}),
            )
            .with_correlation_id(correlation_id.clone())
            .with_sender(request.recipient.clone().unwrap_or_default())
        };
        let notification = || {
            BusMessage::new(
                self.entity_kind.event_name(EntityChange::Insert),
                self.record(&entity_id, request, correlation_id),
            )
        };
        let merge_data = json!({
            "decision": {"action": "respond", "confidence": 0.9},
            "relevantKnowledge": [{"id": "kb-1", "title": "Getting started"}],
        });

        match script {
            Script::ResponseFirst => vec![response(merge_data), notification()],
            Script::NotificationFirst => vec![notification(), response(merge_data)],
            Script::ResponseOnly => vec![response(merge_data)],
            Script::NotificationOnly => vec![notification()],
            Script::Fail { message } => vec![BusMessage::new(
                self.bus_config.direct_response_event.clone(),
                json!({"success": false, "error": message}),
            )
            .with_correlation_id(correlation_id.clone())],
            Script::Silent => Vec::new(),
        }
    }

    fn record(&self, entity_id: &str, request: &BusMessage, correlation_id: &CorrelationId) -> Value {
        let question = request
            .payload
            .get("message")
            .cloned()
            .unwrap_or(Value::Null);
        let mut record = json!({
            "id": entity_id,
            "question": question,
            "answer": format!("Handled {}", request.message_type),
            "timestamp": Utc::now().to_rfc3339(),
        });
        set_pointer(
            &mut record,
            &self.correlation_pointer,
            Value::String(correlation_id.to_string()),
        );
        record
    }
}

fn publish_all(bus: &Weak<dyn MessageBus>, messages: Vec<BusMessage>) -> Result<()> {
    let bus = bus
        .upgrade()
        .ok_or_else(|| Error::transport(None, "Bus dropped before the backend answered"))?;
    for message in messages {
        bus.send(message)?;
    }
    Ok(())
}

impl Route for ScriptedBackend {
    fn deliver(&self, message: BusMessage) -> Result<()> {
        self.received.lock().push(message.clone());

        let correlation_id = message
            .correlation()
            .ok_or_else(|| Error::validation("correlationId", "scripted backend needs a correlation ID"))?;
        let script = self.next_script();
        let outbound = self.plan(&script, &message, &correlation_id);
        tracing::debug!(%correlation_id, script = script.name(), "Scripted backend answering");

        match self.delay {
            None => publish_all(&self.bus, outbound),
            Some(delay) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|e| Error::transport(message.recipient.clone(), "No runtime for delayed answers").caused_by(e))?;
                let bus = self.bus.clone();
                runtime.spawn(async move {
                    for message in outbound {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = publish_all(&bus, vec![message]) {
                            tracing::warn!(error = %e, "Scripted answer not delivered");
                        }
                    }
                });
                Ok(())
            }
        }
    }
}

/// Writes `value` at a JSON pointer, creating intermediate objects
pub fn set_pointer(target: &mut Value, pointer: &str, value: Value) {
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *target = value;
        return;
    };

    let mut current = target;
    for token in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(token.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

/// Registers a backend on `bus` under `recipient` and returns it
pub fn install_backend(
    bus: &Arc<crate::bus::LocalBus>,
    recipient: &str,
    coordination: &CoordinationConfig,
    bus_config: &BusConfig,
) -> Arc<ScriptedBackend> {
    let weak_bus: Weak<dyn MessageBus> = {
        let shared: Arc<dyn MessageBus> = bus.clone();
        Arc::downgrade(&shared)
    };
    let backend = Arc::new(ScriptedBackend::new(weak_bus, bus_config.clone(), coordination));
    bus.register_route(recipient, backend.clone());
    backend
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub script: String,
    pub correlation_id: Option<CorrelationId>,
    pub resolution: Option<Resolution>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenarios: Vec<ScenarioOutcome>,
    pub visible: Vec<VisibleEntry>,
    pub notices: Vec<FailureNotice>,
    pub stats: RelayStats,
}

/// Dispatches one user message per script against `backend`, waits `settle`
/// for delayed answers and timeouts, then reports what the view holds.
///
/// A final dispatch to an unrouted recipient exercises the transport path.
pub async fn run_scenarios(
    coordinator: &CoordinationManager,
    backend: &ScriptedBackend,
    recipient: &str,
    scripts: &[Script],
    settle: Duration,
) -> SimulationReport {
    let mut resolutions = coordinator.subscribe_resolutions();
    let mut scenarios = Vec::new();

    for script in scripts {
        backend.enqueue(script.clone());
        let payload = json!({"message": format!("scenario {}", script.name())});
        let outcome = match coordinator.dispatch(RequestKind::UserMessage, payload, recipient) {
            Ok(correlation_id) => ScenarioOutcome {
                script: script.name().to_string(),
                correlation_id: Some(correlation_id),
                resolution: None,
                error: None,
            },
            Err(e) => ScenarioOutcome {
                script: script.name().to_string(),
                correlation_id: e.correlation_id.clone(),
                resolution: None,
                error: Some(e.message),
            },
        };
        scenarios.push(outcome);
    }

    let unrouted = coordinator.dispatch(RequestKind::UserMessage, json!({"message": "unrouted"}), "nowhere");
    scenarios.push(ScenarioOutcome {
        script: "unrouted".to_string(),
        correlation_id: unrouted.as_ref().err().and_then(|e| e.correlation_id.clone()),
        resolution: None,
        error: unrouted.err().map(|e| e.message),
    });

    tokio::time::sleep(settle).await;

    let mut settled = HashMap::new();
    while let Ok(resolution) = resolutions.try_recv() {
        settled.insert(resolution.correlation_id.clone(), resolution);
    }
    for scenario in &mut scenarios {
        if let Some(correlation_id) = &scenario.correlation_id {
            scenario.resolution = settled.remove(correlation_id);
        }
    }

    SimulationReport {
        scenarios,
        visible: coordinator.visible_entries(),
        notices: coordinator.notices(),
        stats: coordinator.stats(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusHandler, LocalBus};

    fn capture(bus: &LocalBus, event_type: &str) -> (Arc<Mutex<Vec<BusMessage>>>, crate::bus::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: BusHandler = Arc::new(move |message: &BusMessage| sink.lock().push(message.clone()));
        (seen, bus.subscribe(event_type, handler).unwrap())
    }

    #[test]
    fn test_set_pointer_builds_path() {
        let mut record = json!({"id": 1});
        set_pointer(&mut record, "/dev_log_details/correlationId", json!("c1"));
        assert_eq!(record.pointer("/dev_log_details/correlationId"), Some(&json!("c1")));
        assert_eq!(record["id"], 1);
    }

    #[test]
    fn test_plays_scripts_in_order() {
        let coordination = CoordinationConfig::default();
        let bus_config = BusConfig::default();
        let bus = Arc::new(LocalBus::new(bus_config.clone()));
        let backend = install_backend(&bus, "input", &coordination, &bus_config);
        backend.enqueue(Script::NotificationFirst);
        backend.enqueue(Script::Fail {
            message: "nope".into(),
        });

        let (order, _all) = capture(&bus, crate::bus::WILDCARD);
        let request = |id: &str| {
            BusMessage::new("user_input", json!({"message": "hi"}))
                .with_recipient("input")
                .with_correlation_id(id.into())
        };

        bus.send(request("c1")).unwrap();
        bus.send(request("c2")).unwrap();

        let types: Vec<String> = order.lock().iter().map(|m| m.message_type.clone()).collect();
        assert_eq!(
            types,
            vec!["knowledge_record_insert", "agent_response", "agent_response"]
        );
        let first = order.lock()[0].clone();
        assert_eq!(first.payload["dev_log_details"]["correlationId"], "c1");
        assert_eq!(first.payload["question"], "hi");
        assert_eq!(order.lock()[2].payload["success"], false);
        assert_eq!(backend.received().len(), 2);
    }

    #[test]
    fn test_silent_and_missing_correlation() {
        let coordination = CoordinationConfig::default();
        let bus_config = BusConfig::default();
        let bus = Arc::new(LocalBus::new(bus_config.clone()));
        let backend = install_backend(&bus, "input", &coordination, &bus_config);
        backend.enqueue(Script::Silent);
        let (seen, _sub) = capture(&bus, "agent_response");

        bus.send(
            BusMessage::new("user_input", json!({}))
                .with_recipient("input")
                .with_correlation_id("c1".into()),
        )
        .unwrap();
        assert!(seen.lock().is_empty());

        let err = bus
            .send(BusMessage::new("user_input", json!({})).with_recipient("input"))
            .unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::Transport { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_answers() {
        let coordination = CoordinationConfig::default();
        let bus_config = BusConfig::default();
        let bus = Arc::new(LocalBus::new(bus_config.clone()));
        let weak_bus: Weak<dyn MessageBus> = {
            let shared: Arc<dyn MessageBus> = bus.clone();
            Arc::downgrade(&shared)
        };
        let backend = Arc::new(
            ScriptedBackend::new(weak_bus, bus_config.clone(), &coordination)
                .with_fallback(Script::ResponseOnly)
                .with_delay(Duration::from_millis(200)),
        );
        bus.register_route("input", backend);
        let (seen, _sub) = capture(&bus, "agent_response");

        bus.send(
            BusMessage::new("user_input", json!({}))
                .with_recipient("input")
                .with_correlation_id("c1".into()),
        )
        .unwrap();
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(seen.lock().len(), 1);
    }
}
