// src/logging.rs

//! Tracing setup for the relay
//!
//! Console and optional daily-rotated file output are layered on one
//! registry. A small counting layer keeps per-level totals that the manager
//! reports through its status.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::Identity;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};
use uuid::Uuid;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, Result, ResultExt};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogStats {
    pub total_entries: u64,
    pub entries_by_level: HashMap<LogLevel, u64>,
}

/// Counts every event that passes the filter
#[derive(Clone, Debug, Default)]
struct CountingLayer {
    stats: Arc<Mutex<LogStats>>,
}

impl<S> Layer<S> for CountingLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = LogLevel::from(*event.metadata().level());
        let mut stats = self.stats.lock();
        stats.total_entries += 1;
        *stats.entries_by_level.entry(level).or_insert(0) += 1;
    }
}

#[derive(Debug)]
pub struct LoggingManager {
    state: ManagedState,
    config: LoggingConfig,
    counting_layer: CountingLayer,
    _guards: Vec<WorkerGuard>,
    installed: bool,
}

impl LoggingManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "logging_manager"),
            config,
            counting_layer: CountingLayer::default(),
            _guards: Vec::new(),
            installed: false,
        }
    }

    /// Builds the layered subscriber and installs it as the global default.
    ///
    /// Returns `false` when another subscriber was already installed, which
    /// is normal inside test binaries.
    fn setup_tracing(&mut self) -> Result<bool> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.config.level))
            .map_err(|e| {
                Error::config_key(
                    "logging.level",
                    vec![e.to_string()],
                    format!("Invalid log filter '{}'", self.config.level),
                )
            })?;

        let registry = Registry::default().with(filter);

        let registry = if self.config.console.enabled {
            let console_layer = match self.config.format {
                LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
                LogFormat::Pretty => fmt::layer()
                    .with_ansi(self.config.console.colored)
                    .with_target(true)
                    .with_line_number(true)
                    .boxed(),
                LogFormat::Compact => fmt::layer()
                    .compact()
                    .with_ansi(self.config.console.colored)
                    .boxed(),
            };
            registry.with(console_layer)
        } else {
            registry.with(Identity::new().boxed())
        };

        let registry = if let Some(file_config) = &self.config.file {
            let directory = file_config
                .path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory: {}", directory.display())
            })?;

            let file_name = file_config
                .path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("action-relay.log"));
            let file_appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            self._guards.push(guard);

            let file_layer = match self.config.format {
                LogFormat::Json => fmt::layer().json().with_writer(non_blocking).boxed(),
                LogFormat::Pretty => fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .boxed(),
                LogFormat::Compact => fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .boxed(),
            };
            registry.with(file_layer)
        } else {
            registry.with(Identity::new().boxed())
        };

        Ok(registry.with(self.counting_layer.clone()).try_init().is_ok())
    }

    pub fn stats(&self) -> LogStats {
        self.counting_layer.stats.lock().clone()
    }

    /// True when this manager owns the global subscriber
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

#[async_trait]
impl Manager for LoggingManager {
    fn name(&self) -> &str {
        "logging_manager"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        match self.setup_tracing() {
            Ok(installed) => {
                self.installed = installed;
                if !installed {
                    tracing::debug!("Global tracing subscriber already set; keeping it");
                }
            }
            Err(e) => {
                self.state.set_state(ManagerState::Error).await;
                return Err(e.source("logging_manager"));
            }
        }

        self.state.set_state(ManagerState::Running).await;
        tracing::info!(level = %self.config.level, "Logging manager initialized");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;
        tracing::info!("Shutting down logging manager");

        // dropping the guards flushes the non-blocking file writers
        self._guards.clear();

        self.state.set_state(ManagerState::Shutdown).await;
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let stats = self.stats();

        status.add_metadata("total_entries", serde_json::Value::from(stats.total_entries));
        status.add_metadata("installed", serde_json::Value::Bool(self.installed));
        status.add_metadata("file_logging", serde_json::Value::Bool(self.config.file.is_some()));
        status.add_metadata("console_logging", serde_json::Value::Bool(self.config.console.enabled));
        status.add_metadata("log_level", serde_json::Value::String(self.config.level.clone()));

        status
    }
}
