// src/manager.rs - Lifecycle contract shared by every long-lived component

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, ManagerOperation, Result};
use crate::types::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerState {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    Shutdown,
    Error,
}

impl ManagerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Shutdown => "SHUTDOWN",
            Self::Error => "ERROR",
        }
    }

    /// Forward-only lifecycle; `Error` is reachable from anywhere and a
    /// failed start may be retried
    pub fn can_transition_to(self, next: ManagerState) -> bool {
        use ManagerState::*;

        matches!(
            (self, next),
            (_, Error)
                | (Created | Error, Initializing)
                | (Initializing, Running)
                | (Running | Initializing | Error, ShuttingDown)
                | (ShuttingDown, Shutdown)
        )
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Health implied by a lifecycle state alone
    pub fn from_state(state: ManagerState) -> Self {
        match state {
            ManagerState::Running => Self::Healthy,
            ManagerState::Initializing | ManagerState::ShuttingDown => Self::Degraded,
            ManagerState::Error => Self::Unhealthy,
            ManagerState::Created | ManagerState::Shutdown => Self::Unknown,
        }
    }

    /// Worst of the two, with `Unknown` ranked between degraded and unhealthy
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        fn rank(status: HealthStatus) -> u8 {
            match status {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unknown => 2,
                HealthStatus::Unhealthy => 3,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub id: Uuid,
    pub name: String,
    pub state: ManagerState,
    pub health: HealthStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub message: Option<String>,
    pub metadata: Metadata,
}

impl ManagerStatus {
    pub fn new(id: Uuid, name: impl Into<String>, state: ManagerState) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            state,
            health: HealthStatus::from_state(state),
            created_at: now,
            started_at: None,
            last_updated: now,
            message: None,
            metadata: HashMap::new(),
        }
    }

    /// Records `state` and resets health to what it implies
    pub fn update_state(&mut self, state: ManagerState) {
        let now = Utc::now();
        if state == ManagerState::Running {
            self.started_at.get_or_insert(now);
        }
        self.state = state;
        self.health = HealthStatus::from_state(state);
        self.last_updated = now;
    }

    /// Time spent running, while running
    pub fn uptime(&self) -> Option<Duration> {
        match (self.state, self.started_at) {
            (ManagerState::Running, Some(started)) => (Utc::now() - started).to_std().ok(),
            _ => None,
        }
    }

    pub fn set_health(&mut self, health: HealthStatus) {
        self.health = health;
        self.last_updated = Utc::now();
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
        self.last_updated = Utc::now();
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
        self.last_updated = Utc::now();
    }
}

/// Core trait for all long-lived components
#[async_trait]
pub trait Manager: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn id(&self) -> Uuid;

    async fn initialize(&mut self) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;

    async fn status(&self) -> ManagerStatus;

    async fn health_check(&self) -> HealthStatus {
        self.status().await.health
    }

    /// Current configuration as JSON, when the manager has any
    async fn get_config(&self) -> Option<serde_json::Value> {
        None
    }

    async fn update_config(&mut self, _config: serde_json::Value) -> Result<()> {
        Err(Error::manager(
            self.name(),
            ManagerOperation::Configure,
            "Configuration update not supported",
        ))
    }

    /// An unhealthy essential manager makes the application unhealthy
    fn is_essential(&self) -> bool {
        false
    }
}

/// Status bookkeeping embedded in each manager
pub struct ManagedState {
    id: Uuid,
    name: String,
    status: Arc<RwLock<ManagerStatus>>,
}

impl ManagedState {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            status: Arc::new(RwLock::new(ManagerStatus::new(
                id,
                name.clone(),
                ManagerState::Created,
            ))),
            name,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Moves to `state`. Jumps the lifecycle does not allow are recorded
    /// anyway and logged.
    pub async fn set_state(&self, state: ManagerState) {
        let mut status = self.status.write().await;
        if status.state != state && !status.state.can_transition_to(state) {
            tracing::warn!(
                manager = %self.name,
                from = %status.state,
                to = %state,
                "Unexpected manager state transition"
            );
        }
        status.update_state(state);
    }

    pub async fn set_health(&self, health: HealthStatus) {
        self.status.write().await.set_health(health);
    }

    pub async fn set_message(&self, message: impl Into<String>) {
        self.status.write().await.set_message(message);
    }

    pub async fn status(&self) -> ManagerStatus {
        self.status.read().await.clone()
    }

    pub async fn state(&self) -> ManagerState {
        self.status.read().await.state
    }
}

impl fmt::Debug for ManagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedState")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Probe {
        state: ManagedState,
        essential: bool,
    }

    #[async_trait]
    impl Manager for Probe {
        fn name(&self) -> &str {
            self.state.name()
        }

        fn id(&self) -> Uuid {
            self.state.id()
        }

        async fn initialize(&mut self) -> Result<()> {
            self.state.set_state(ManagerState::Initializing).await;
            self.state.set_state(ManagerState::Running).await;
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.state.set_state(ManagerState::ShuttingDown).await;
            self.state.set_state(ManagerState::Shutdown).await;
            Ok(())
        }

        async fn status(&self) -> ManagerStatus {
            self.state.status().await
        }

        fn is_essential(&self) -> bool {
            self.essential
        }
    }

    fn probe(essential: bool) -> Probe {
        Probe {
            state: ManagedState::new(Uuid::new_v4(), "probe"),
            essential,
        }
    }

    #[tokio::test]
    async fn test_health_follows_lifecycle() {
        let mut manager = probe(true);
        assert_eq!(manager.health_check().await, HealthStatus::Unknown);

        manager.initialize().await.unwrap();
        let status = manager.status().await;
        assert_eq!(status.state, ManagerState::Running);
        assert_eq!(manager.health_check().await, HealthStatus::Healthy);
        assert!(status.started_at.is_some());
        assert!(status.uptime().is_some());

        manager.state.set_health(HealthStatus::Degraded).await;
        assert_eq!(manager.health_check().await, HealthStatus::Degraded);

        manager.shutdown().await.unwrap();
        let status = manager.status().await;
        assert_eq!(status.state, ManagerState::Shutdown);
        assert!(status.uptime().is_none());
        assert!(manager.is_essential());
    }

    #[test]
    fn test_transitions() {
        use ManagerState::*;

        assert!(Created.can_transition_to(Initializing));
        assert!(Running.can_transition_to(ShuttingDown));
        assert!(Error.can_transition_to(Initializing));
        assert!(Shutdown.can_transition_to(Error));
        assert!(!Shutdown.can_transition_to(Initializing));
        assert!(!Created.can_transition_to(Running));
    }

    #[test]
    fn test_worst_health() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Unknown),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_update_config_unsupported_by_default() {
        let mut manager = probe(false);
        let err = manager
            .update_config(serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            crate::error::ErrorKind::Manager {
                operation: ManagerOperation::Configure,
                ..
            }
        ));
    }
}
