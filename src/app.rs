// src/app.rs

//! Application core and manager orchestration
//!
//! Brings the managers up in dependency order (config, logging, bus,
//! coordinator) and tears them down in reverse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

use crate::bus::{LocalBus, Route};
use crate::config::{AppConfig, ConfigManager};
use crate::coordinator::CoordinationManager;
use crate::error::{Error, ManagerOperation, Result, ResultExt};
use crate::logging::LoggingManager;
use crate::manager::{HealthStatus, ManagedState, Manager, ManagerState, ManagerStatus};
use crate::simulation::{self, ScriptedBackend};

const NAME: &str = "relay_application";

/// Priority of programmatic overrides; above the environment layer
const OVERRIDE_PRIORITY: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationState {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    Shutdown,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationHealth {
    pub status: HealthStatus,
    pub uptime: Duration,
    pub managers: HashMap<String, HealthStatus>,
    pub last_check: DateTime<Utc>,
}

pub struct RelayApplication {
    state: ManagedState,
    app_state: Arc<RwLock<ApplicationState>>,
    started_at: DateTime<Utc>,

    config_path: Option<PathBuf>,
    overrides: Option<Value>,
    routes: Vec<(String, Arc<dyn Route>)>,

    config_manager: Option<ConfigManager>,
    logging_manager: Option<LoggingManager>,
    bus: Option<Arc<LocalBus>>,
    coordinator: Option<CoordinationManager>,

    shutdown_signal: broadcast::Sender<()>,
}

impl std::fmt::Debug for RelayApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayApplication")
            .field("config_path", &self.config_path)
            .field("routes", &self.routes.len())
            .field("bus", &self.bus.is_some())
            .field("coordinator", &self.coordinator.is_some())
            .finish()
    }
}

impl RelayApplication {
    pub fn new() -> Self {
        let (shutdown_signal, _) = broadcast::channel(1);

        Self {
            state: ManagedState::new(Uuid::new_v4(), NAME),
            app_state: Arc::new(RwLock::new(ApplicationState::Created)),
            started_at: Utc::now(),
            config_path: None,
            overrides: None,
            routes: Vec::new(),
            config_manager: None,
            logging_manager: None,
            bus: None,
            coordinator: None,
            shutdown_signal,
        }
    }

    pub fn with_config_file(mut self, config_path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(config_path.into());
        self
    }

    /// Config values that win over files and the environment
    pub fn with_overrides(mut self, overrides: Value) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Route installed on the bus once it is up
    pub fn with_route(mut self, recipient: impl Into<String>, route: Arc<dyn Route>) -> Self {
        self.routes.push((recipient.into(), route));
        self
    }

    pub async fn initialize(&mut self) -> Result<()> {
        *self.app_state.write().await = ApplicationState::Initializing;
        self.state.set_state(ManagerState::Initializing).await;

        let result = self.init_managers().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Application failed to start");
            *self.app_state.write().await = ApplicationState::Error;
            self.state.set_state(ManagerState::Error).await;
            return result;
        }

        self.setup_signal_handlers();

        *self.app_state.write().await = ApplicationState::Running;
        self.state.set_state(ManagerState::Running).await;
        tracing::info!(version = crate::VERSION, "Action relay running");
        Ok(())
    }

    async fn init_managers(&mut self) -> Result<()> {
        self.init_config_manager().await?;
        let config = self.get_config().await?;
        self.init_logging_manager(&config).await?;
        self.init_bus(&config).await?;
        self.init_coordinator(&config).await
    }

    async fn init_config_manager(&mut self) -> Result<()> {
        let mut config_manager = match &self.config_path {
            Some(path) => ConfigManager::with_config_file(path)?,
            None => ConfigManager::new(),
        };
        if let Some(overrides) = self.overrides.clone() {
            config_manager.add_memory_layer("overrides", overrides, OVERRIDE_PRIORITY);
        }

        config_manager
            .initialize()
            .await
            .with_context(|| "Failed to initialize configuration manager".to_string())?;
        self.config_manager = Some(config_manager);
        Ok(())
    }

    async fn init_logging_manager(&mut self, config: &AppConfig) -> Result<()> {
        let mut logging_manager = LoggingManager::new(config.logging.clone());
        logging_manager
            .initialize()
            .await
            .with_context(|| "Failed to initialize logging manager".to_string())?;
        self.logging_manager = Some(logging_manager);
        Ok(())
    }

    async fn init_bus(&mut self, config: &AppConfig) -> Result<()> {
        let mut bus = LocalBus::new(config.bus.clone());
        bus.initialize()
            .await
            .with_context(|| "Failed to initialize local bus".to_string())?;

        for (recipient, route) in self.routes.drain(..) {
            bus.register_route(recipient, route);
        }
        self.bus = Some(Arc::new(bus));
        Ok(())
    }

    async fn init_coordinator(&mut self, config: &AppConfig) -> Result<()> {
        let bus = self.bus.clone().ok_or_else(|| {
            Error::manager(NAME, ManagerOperation::Initialize, "Bus must start before the coordinator")
        })?;

        let mut coordination = config.coordination.clone();
        if coordination.session_user_id.is_none() {
            coordination.session_user_id = std::env::var("ACTION_RELAY_USER").ok();
        }

        let mut coordinator = CoordinationManager::new(coordination, config.bus.clone(), bus);
        coordinator
            .initialize()
            .await
            .with_context(|| "Failed to initialize coordination manager".to_string())?;
        self.coordinator = Some(coordinator);
        Ok(())
    }

    fn setup_signal_handlers(&self) {
        let shutdown_sender = self.shutdown_signal.clone();
        let app_state = Arc::clone(&self.app_state);

        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Could not listen for Ctrl+C");
                return;
            }
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            *app_state.write().await = ApplicationState::ShuttingDown;
            let _ = shutdown_sender.send(());
        });
    }

    /// Installs a scripted backend under `recipient` on the running bus
    pub async fn install_scripted_backend(&self, recipient: &str) -> Result<Arc<ScriptedBackend>> {
        let bus = self.bus.as_ref().ok_or_else(|| {
            Error::manager(
                NAME,
                ManagerOperation::Operation("install_backend".to_string()),
                "Bus is not running",
            )
        })?;
        let config = self.get_config().await?;
        Ok(simulation::install_backend(
            bus,
            recipient,
            &config.coordination,
            &config.bus,
        ))
    }

    pub fn coordinator(&self) -> Option<&CoordinationManager> {
        self.coordinator.as_ref()
    }

    pub fn bus(&self) -> Option<&Arc<LocalBus>> {
        self.bus.as_ref()
    }

    pub fn logging(&self) -> Option<&LoggingManager> {
        self.logging_manager.as_ref()
    }

    pub async fn get_config(&self) -> Result<AppConfig> {
        match &self.config_manager {
            Some(config_manager) => config_manager.get_config().await,
            None => Err(Error::config("Configuration manager not initialized")),
        }
    }

    pub async fn get_state(&self) -> ApplicationState {
        *self.app_state.read().await
    }

    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let mut receiver = self.shutdown_signal.subscribe();
        receiver.recv().await.map_err(|_| {
            Error::manager(
                NAME,
                ManagerOperation::Shutdown,
                "Shutdown signal channel closed unexpectedly",
            )
        })?;
        Ok(())
    }

    pub async fn get_health(&self) -> ApplicationHealth {
        let mut managers = HashMap::new();
        let mut status = HealthStatus::Healthy;

        let running: [Option<&dyn Manager>; 4] = [
            self.config_manager.as_ref().map(|m| m as &dyn Manager),
            self.logging_manager.as_ref().map(|m| m as &dyn Manager),
            self.bus.as_deref().map(|m| m as &dyn Manager),
            self.coordinator.as_ref().map(|m| m as &dyn Manager),
        ];
        for manager in running.into_iter().flatten() {
            let health = manager.health_check().await;
            // a sick non-essential manager only degrades the application
            let impact = match health {
                HealthStatus::Unhealthy | HealthStatus::Unknown if !manager.is_essential() => {
                    HealthStatus::Degraded
                }
                other => other,
            };
            status = status.worst(impact);
            managers.insert(manager.name().to_string(), health);
        }
        if managers.is_empty() {
            status = HealthStatus::Unknown;
        }

        ApplicationHealth {
            status,
            uptime: (Utc::now() - self.started_at).to_std().unwrap_or_default(),
            managers,
            last_check: Utc::now(),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        *self.app_state.write().await = ApplicationState::ShuttingDown;
        self.state.set_state(ManagerState::ShuttingDown).await;
        tracing::info!("Shutting down action relay");

        if let Some(mut coordinator) = self.coordinator.take() {
            if let Ok(Err(e)) = timeout(Duration::from_secs(5), coordinator.shutdown()).await {
                tracing::error!(error = %e, "Error shutting down coordinator");
            }
        }

        if let Some(bus) = self.bus.take() {
            match Arc::try_unwrap(bus) {
                Ok(mut bus) => {
                    let _ = timeout(Duration::from_secs(5), bus.shutdown()).await;
                }
                // someone still holds the bus; stop delivery regardless
                Err(bus) => bus.close(),
            }
        }

        if let Some(mut logging_manager) = self.logging_manager.take() {
            let _ = timeout(Duration::from_secs(5), logging_manager.shutdown()).await;
        }

        if let Some(mut config_manager) = self.config_manager.take() {
            let _ = timeout(Duration::from_secs(2), config_manager.shutdown()).await;
        }

        *self.app_state.write().await = ApplicationState::Shutdown;
        self.state.set_state(ManagerState::Shutdown).await;
        tracing::info!("Action relay shutdown complete");
        Ok(())
    }
}

impl Default for RelayApplication {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Manager for RelayApplication {
    fn name(&self) -> &str {
        NAME
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        RelayApplication::initialize(self).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        RelayApplication::shutdown(self).await
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let health = self.get_health().await;
        status.set_health(health.status);
        status.add_metadata("uptime_seconds", Value::from(health.uptime.as_secs()));
        status.add_metadata("managers", Value::from(health.managers.len()));
        status
    }

    async fn health_check(&self) -> HealthStatus {
        self.get_health().await.status
    }
}
