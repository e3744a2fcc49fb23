// src/lifecycle.rs

//! Per-correlation operation state machine and terminal resolutions
//!
//! Every dispatched operation moves through a small set of phases:
//!
//! ```text
//! Dispatched ──response(ok, data)──▶ AwaitingNotification ──notification──▶ Resolved
//!     │  └──response(ok, no data)─────────────────────────────────────────▶ Resolved
//!     ├──response(error) / transport failure ─────────────────────────────▶ Failed
//!     ├──sweep ───────────────────────────────────────────────────────────▶ TimedOut
//!     └──cancel ──────────────────────────────────────────────────────────▶ Cancelled
//! ```
//!
//! `AwaitingNotification` may additionally time out when its cached result
//! outlives the result TTL. Terminal phases are never stored; reaching one
//! removes the operation from every registry.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::correlation::CorrelationId;
use crate::error::Error;
use crate::types::RequestKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Dispatched,
    AwaitingNotification,
    Resolved,
    Failed,
    TimedOut,
    Cancelled,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Resolved | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatched => write!(f, "DISPATCHED"),
            Self::AwaitingNotification => write!(f, "AWAITING_NOTIFICATION"),
            Self::Resolved => write!(f, "RESOLVED"),
            Self::Failed => write!(f, "FAILED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Successful direct response whose data must wait for an entity
    ResponseWithPendingData,
    /// Successful direct response with nothing left to merge
    ResponseSettled,
    ResponseFailed,
    TransportFailed,
    NotificationMerged,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("phase {from} is terminal; {event:?} ignored")]
    AlreadyTerminal {
        from: OperationPhase,
        event: LifecycleEvent,
    },
    #[error("event {event:?} is not valid in phase {from}")]
    Invalid {
        from: OperationPhase,
        event: LifecycleEvent,
    },
}

/// Computes the next phase for `event`
pub fn transition(
    from: OperationPhase,
    event: LifecycleEvent,
) -> Result<OperationPhase, TransitionError> {
    use LifecycleEvent as E;
    use OperationPhase as P;

    if from.is_terminal() {
        return Err(TransitionError::AlreadyTerminal { from, event });
    }

    match (from, event) {
        (P::Dispatched, E::ResponseWithPendingData) => Ok(P::AwaitingNotification),
        (P::Dispatched, E::ResponseSettled) => Ok(P::Resolved),
        (P::Dispatched, E::ResponseFailed) => Ok(P::Failed),
        (P::Dispatched, E::TransportFailed) => Ok(P::Failed),
        (P::AwaitingNotification, E::NotificationMerged) => Ok(P::Resolved),
        (_, E::Expired) => Ok(P::TimedOut),
        (_, E::Cancelled) => Ok(P::Cancelled),
        (from, event) => Err(TransitionError::Invalid { from, event }),
    }
}

/// Non-terminal phases of live operations
#[derive(Debug, Default)]
pub struct LifecycleTable {
    phases: HashMap<CorrelationId, OperationPhase>,
}

impl LifecycleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, correlation_id: CorrelationId) {
        self.phases
            .insert(correlation_id, OperationPhase::Dispatched);
    }

    pub fn phase(&self, correlation_id: &CorrelationId) -> Option<OperationPhase> {
        self.phases.get(correlation_id).copied()
    }

    /// Applies `event`; terminal results drop the entry. Unknown IDs yield
    /// `None` without mutating anything.
    pub fn apply(
        &mut self,
        correlation_id: &CorrelationId,
        event: LifecycleEvent,
    ) -> Option<Result<OperationPhase, TransitionError>> {
        let from = self.phases.get(correlation_id).copied()?;
        let next = transition(from, event);
        match next {
            Ok(phase) if phase.is_terminal() => {
                self.phases.remove(correlation_id);
            }
            Ok(phase) => {
                self.phases.insert(correlation_id.clone(), phase);
            }
            Err(_) => {}
        }
        Some(next)
    }

    pub fn forget(&mut self, correlation_id: &CorrelationId) -> Option<OperationPhase> {
        self.phases.remove(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Backend,
    Timeout,
    Transport,
    Cancelled,
}

impl FailureReason {
    /// Crate error carrying this failure
    pub fn error(self, recipient: Option<String>, message: impl Into<String>) -> Error {
        match self {
            Self::Backend => Error::backend(recipient, message),
            Self::Timeout => Error::timeout(message),
            Self::Transport => Error::transport(recipient, message),
            Self::Cancelled => Error::cancelled(message),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend => write!(f, "backend error"),
            Self::Timeout => write!(f, "timed out"),
            Self::Transport => write!(f, "transport error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { data: Option<Value> },
    Failed { reason: FailureReason, message: String },
}

/// Terminal answer for one correlation ID, delivered to UI listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub correlation_id: CorrelationId,
    pub kind: RequestKind,
    pub outcome: Outcome,
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    pub fn succeeded(correlation_id: CorrelationId, kind: RequestKind, data: Option<Value>) -> Self {
        Self {
            correlation_id,
            kind,
            outcome: Outcome::Succeeded { data },
            resolved_at: Utc::now(),
        }
    }

    pub fn failed(
        correlation_id: CorrelationId,
        kind: RequestKind,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            kind,
            outcome: Outcome::Failed {
                reason,
                message: message.into(),
            },
            resolved_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded { .. })
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.outcome {
            Outcome::Failed { reason, .. } => Some(*reason),
            Outcome::Succeeded { .. } => None,
        }
    }

    /// Response data on success, otherwise the failure as a crate error
    pub fn into_result(self) -> crate::error::Result<Option<Value>> {
        match self.outcome {
            Outcome::Succeeded { data } => Ok(data),
            Outcome::Failed { reason, message } => {
                Err(reason.error(None, message).correlation_id(self.correlation_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_with_merge() {
        let awaiting =
            transition(OperationPhase::Dispatched, LifecycleEvent::ResponseWithPendingData)
                .unwrap();
        assert_eq!(awaiting, OperationPhase::AwaitingNotification);
        assert_eq!(
            transition(awaiting, LifecycleEvent::NotificationMerged).unwrap(),
            OperationPhase::Resolved
        );
    }

    #[test]
    fn test_terminal_phases_reject_events() {
        let err = transition(OperationPhase::Failed, LifecycleEvent::ResponseSettled).unwrap_err();
        assert!(matches!(err, TransitionError::AlreadyTerminal { .. }));
    }

    #[test]
    fn test_merge_requires_awaiting_phase() {
        let err = transition(OperationPhase::Dispatched, LifecycleEvent::NotificationMerged)
            .unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));
    }

    #[test]
    fn test_table_drops_terminal_entries() {
        let mut table = LifecycleTable::new();
        let id = CorrelationId::from("c1");
        table.begin(id.clone());

        let phase = table
            .apply(&id, LifecycleEvent::ResponseWithPendingData)
            .unwrap()
            .unwrap();
        assert_eq!(phase, OperationPhase::AwaitingNotification);
        assert_eq!(table.phase(&id), Some(OperationPhase::AwaitingNotification));

        table.apply(&id, LifecycleEvent::NotificationMerged);
        assert_eq!(table.phase(&id), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_failed_resolution_becomes_error() {
        use crate::error::ErrorKind;

        let cases = [
            (FailureReason::Backend, "backend"),
            (FailureReason::Timeout, "timeout"),
            (FailureReason::Transport, "transport"),
            (FailureReason::Cancelled, "cancelled"),
        ];
        for (reason, label) in cases {
            let resolution =
                Resolution::failed("req-1".into(), RequestKind::UserMessage, reason, label);
            let error = resolution.into_result().unwrap_err();
            assert_eq!(error.message, label);
            assert_eq!(error.correlation_id, Some(CorrelationId::from("req-1")));
            let matched = match reason {
                FailureReason::Backend => matches!(error.kind, ErrorKind::Backend { .. }),
                FailureReason::Timeout => error.kind == ErrorKind::Timeout,
                FailureReason::Transport => matches!(error.kind, ErrorKind::Transport { .. }),
                FailureReason::Cancelled => error.kind == ErrorKind::Cancelled,
            };
            assert!(matched, "{} mapped to {:?}", label, error.kind);
        }

        let ok = Resolution::succeeded("req-2".into(), RequestKind::UserMessage, None);
        assert_eq!(ok.into_result().unwrap(), None);
    }

    #[test]
    fn test_unknown_id_is_untouched() {
        let mut table = LifecycleTable::new();
        assert!(table.apply(&"ghost".into(), LifecycleEvent::Expired).is_none());
        assert!(table.is_empty());
    }
}
