// src/error.rs - Error handling for the coordination layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::correlation::CorrelationId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration {
        key: Option<String>,
        validation_errors: Vec<String>,
    },
    Manager {
        manager_name: String,
        operation: ManagerOperation,
    },
    Event {
        event_type: Option<String>,
        subscription_id: Option<Uuid>,
        operation: EventOperation,
    },
    /// The bus refused or could not deliver an outbound message.
    Transport {
        recipient: Option<String>,
    },
    /// The backend answered with `success: false`.
    Backend {
        recipient: Option<String>,
    },
    /// An inbound event referenced a correlation ID with no pending state.
    StaleEvent,
    Validation {
        field: Option<String>,
        rules: Vec<String>,
    },
    Io,
    Serialization,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerOperation {
    Initialize,
    Shutdown,
    Configure,
    Operation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOperation {
    Publish,
    Subscribe,
    Unsubscribe,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub severity: ErrorSeverity,
    pub source: String,
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
    pub metadata: crate::types::Metadata,
    pub causes: Vec<String>,
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            severity: ErrorSeverity::Medium,
            source: "unknown".to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            metadata: std::collections::HashMap::new(),
            causes: Vec::new(),
        }
    }

    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Adds a cause to the error chain
    pub fn caused_by(mut self, cause: impl fmt::Display) -> Self {
        self.causes.push(cause.to_string());
        self
    }

    pub fn is_critical(&self) -> bool {
        matches!(self.severity, ErrorSeverity::Critical)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Configuration {
                key: None,
                validation_errors: Vec::new(),
            },
            message,
        )
        .severity(ErrorSeverity::High)
    }

    pub fn config_key(
        key: impl Into<String>,
        validation_errors: Vec<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Configuration {
                key: Some(key.into()),
                validation_errors,
            },
            message,
        )
        .severity(ErrorSeverity::High)
    }

    pub fn manager(
        manager_name: impl Into<String>,
        operation: ManagerOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Manager {
                manager_name: manager_name.into(),
                operation,
            },
            message,
        )
        .severity(ErrorSeverity::High)
    }

    pub fn event(
        event_type: Option<String>,
        operation: EventOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Event {
                event_type,
                subscription_id: None,
                operation,
            },
            message,
        )
    }

    /// Creates a transport error (bus unavailable, no route for recipient)
    pub fn transport(recipient: Option<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport { recipient }, message)
            .severity(ErrorSeverity::High)
            .source("bus")
    }

    /// Creates a backend error from a failed direct response
    pub fn backend(recipient: Option<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend { recipient }, message).source("backend")
    }

    pub fn stale_event(correlation_id: CorrelationId) -> Self {
        Self::new(
            ErrorKind::StaleEvent,
            format!("no pending state for correlation id {}", correlation_id),
        )
        .severity(ErrorSeverity::Low)
        .correlation_id(correlation_id)
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Validation {
                field: Some(field.into()),
                rules: Vec::new(),
            },
            message,
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message).severity(ErrorSeverity::Low)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.correlation_id {
            Some(correlation_id) => write!(
                f,
                "[{}] {} ({}): {}",
                self.severity, self.source, correlation_id, self.message
            ),
            None => write!(f, "[{}] {}: {}", self.severity, self.source, self.message),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, err.to_string())
            .source("std::io::Error")
            .severity(ErrorSeverity::High)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Serialization, err.to_string()).source("serde_json")
    }
}

/// Extension trait for Results to add context
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    fn with_source(self, source: impl Into<String>) -> Result<T>;

    fn with_correlation(self, correlation_id: &CorrelationId) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::new(ErrorKind::Io, f()).caused_by(e))
    }

    fn with_source(self, source: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            Error::new(ErrorKind::Io, e.to_string())
                .source(source)
                .caused_by(e)
        })
    }

    fn with_correlation(self, correlation_id: &CorrelationId) -> Result<T> {
        self.map_err(|e| {
            Error::new(ErrorKind::Serialization, e.to_string())
                .correlation_id(correlation_id.clone())
                .caused_by(e)
        })
    }
}
