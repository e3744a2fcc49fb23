// src/config/mod.rs

//! Layered configuration for the coordination layer
//!
//! Layers are merged lowest priority first:
//! - built-in defaults
//! - YAML, JSON or TOML files
//! - in-memory JSON overrides
//! - environment variables (`ACTION_RELAY__SECTION__KEY`)

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::{Error, ManagerOperation, Result};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};
use crate::types::Metadata;

pub const ENV_PREFIX: &str = "ACTION_RELAY";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    pub key: String,
    pub value: Value,
    pub old_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub key: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation error for '{}': {}", self.key, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    fn parse(self, content: &str) -> Result<Value> {
        match self {
            Self::Json => serde_json::from_str(content)
                .map_err(|e| Error::config(format!("Failed to parse JSON config: {}", e))),
            Self::Yaml => serde_yaml::from_str(content)
                .map_err(|e| Error::config(format!("Failed to parse YAML config: {}", e))),
            Self::Toml => toml::from_str(content)
                .map_err(|e| Error::config(format!("Failed to parse TOML config: {}", e))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigSource {
    File { path: PathBuf, format: ConfigFormat },
    Environment { prefix: String },
    Memory { data: Value },
}

#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub name: String,
    pub source: ConfigSource,
    pub priority: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSettings,
    pub logging: LoggingConfig,
    pub bus: BusConfig,
    pub coordination: CoordinationConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |key: &str, message: &str| {
            errors.push(ValidationError {
                key: key.to_string(),
                message: message.to_string(),
            })
        };

        let coordination = &self.coordination;
        if coordination.request_timeout_ms == 0 {
            push("coordination.request_timeout_ms", "must be greater than zero");
        }
        if coordination.result_ttl_ms == 0 {
            push("coordination.result_ttl_ms", "must be greater than zero");
        }
        if coordination.sweep_interval_ms == 0 {
            push("coordination.sweep_interval_ms", "must be greater than zero");
        } else if coordination.sweep_interval_ms >= coordination.request_timeout_ms {
            push(
                "coordination.sweep_interval_ms",
                "must be shorter than coordination.request_timeout_ms",
            );
        }
        if !coordination.correlation_pointer.starts_with('/') {
            push(
                "coordination.correlation_pointer",
                "must be a JSON pointer starting with '/'",
            );
        }
        if coordination.decision_field.trim().is_empty() {
            push("coordination.decision_field", "must not be empty");
        }
        if coordination.auxiliary_field.trim().is_empty() {
            push("coordination.auxiliary_field", "must not be empty");
        }
        if coordination.resolution_buffer == 0 {
            push("coordination.resolution_buffer", "must be greater than zero");
        }

        for (key, value) in [
            ("bus.direct_response_event", &self.bus.direct_response_event),
            ("bus.suggestion_event", &self.bus.suggestion_event),
            ("bus.status_event", &self.bus.status_event),
        ] {
            if value.trim().is_empty() {
                push(key, "event name must not be empty");
            }
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            push("logging.level", "not a valid tracing filter directive");
        }

        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "action-relay".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub console: ConsoleLogConfig,
    pub file: Option<FileLogConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            console: ConsoleLogConfig::default(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleLogConfig {
    pub enabled: bool,
    pub colored: bool,
}

impl Default for ConsoleLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            colored: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    pub path: PathBuf,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logs/action-relay.log"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Category carrying direct responses to dispatched requests
    pub direct_response_event: String,
    pub suggestion_event: String,
    pub status_event: String,
    /// Keep delivering to other subscribers when one handler panics
    pub isolate_handler_panics: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            direct_response_event: "agent_response".to_string(),
            suggestion_event: "suggestion_update".to_string(),
            status_event: "status_update".to_string(),
            isolate_handler_panics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub request_timeout_ms: u64,
    pub result_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    /// JSON pointer to the correlation ID inside a persisted record
    pub correlation_pointer: String,
    /// Response data field holding the structured decision
    pub decision_field: String,
    /// Response data field holding supporting context
    pub auxiliary_field: String,
    pub max_notices: usize,
    pub resolution_buffer: usize,
    pub default_sender: String,
    /// Ambient updates addressed to another user are ignored when set
    pub session_user_id: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 45_000,
            result_ttl_ms: 60_000,
            sweep_interval_ms: 5_000,
            correlation_pointer: "/dev_log_details/correlationId".to_string(),
            decision_field: "decision".to_string(),
            auxiliary_field: "relevantKnowledge".to_string(),
            max_notices: 50,
            resolution_buffer: 256,
            default_sender: "ui".to_string(),
            session_user_id: None,
        }
    }
}

impl CoordinationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_millis(self.result_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

pub struct ConfigManager {
    state: ManagedState,
    layers: Vec<ConfigLayer>,
    merged_config: RwLock<Value>,
    change_notifier: broadcast::Sender<ConfigChangeEvent>,
    env_prefix: String,
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("layers", &self.layers.len())
            .field("env_prefix", &self.env_prefix)
            .finish()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        let (change_notifier, _) = broadcast::channel(100);

        Self {
            state: ManagedState::new(Uuid::new_v4(), "config_manager"),
            layers: Vec::new(),
            merged_config: RwLock::new(Value::Object(Map::new())),
            change_notifier,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    pub fn with_config_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut manager = Self::new();
        manager.add_file_layer("file", config_path, 10)?;
        Ok(manager)
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn add_file_layer<P: AsRef<Path>>(
        &mut self,
        name: impl Into<String>,
        path: P,
        priority: u32,
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let format = ConfigFormat::from_extension(&path).ok_or_else(|| {
            Error::config(format!(
                "Unsupported configuration file format: {}",
                path.display()
            ))
        })?;

        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::File { path, format },
            priority,
        });
        Ok(())
    }

    pub fn add_env_layer(&mut self, name: impl Into<String>, prefix: impl Into<String>, priority: u32) {
        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::Environment {
                prefix: prefix.into(),
            },
            priority,
        });
    }

    pub fn add_memory_layer(&mut self, name: impl Into<String>, data: Value, priority: u32) {
        self.push_layer(ConfigLayer {
            name: name.into(),
            source: ConfigSource::Memory { data },
            priority,
        });
    }

    fn push_layer(&mut self, layer: ConfigLayer) {
        self.layers.push(layer);
        self.layers.sort_by_key(|l| l.priority);
    }

    pub async fn set<T>(&self, key: &str, value: T) -> Result<()>
    where
        T: Serialize,
    {
        let serialized_value = serde_json::to_value(value).map_err(|e| {
            Error::config_key(
                key,
                vec![e.to_string()],
                format!("Failed to serialize config value: {}", e),
            )
        })?;

        let mut config = self.merged_config.write().await;
        let old_value = get_nested_value(&config, key);
        set_nested_value(&mut config, key, serialized_value.clone());
        drop(config);

        let _ = self.change_notifier.send(ConfigChangeEvent {
            key: key.to_string(),
            value: serialized_value,
            old_value,
            timestamp: Utc::now(),
            source: "config_manager".to_string(),
            metadata: HashMap::new(),
        });

        Ok(())
    }

    pub async fn get<T>(&self, key: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let config = self.merged_config.read().await;
        let value = get_nested_value(&config, key).ok_or_else(|| {
            Error::config_key(
                key,
                vec![format!("Configuration key '{}' not found", key)],
                "Configuration key not found",
            )
        })?;

        serde_json::from_value(value).map_err(|e| {
            Error::config_key(
                key,
                vec![e.to_string()],
                format!("Failed to deserialize config value: {}", e),
            )
        })
    }

    pub async fn get_config(&self) -> Result<AppConfig> {
        let config = self.merged_config.read().await;
        serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("Failed to deserialize config: {}", e)))
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_notifier.subscribe()
    }

    pub async fn reload(&self) -> Result<()> {
        self.merge_configurations().await?;

        let _ = self.change_notifier.send(ConfigChangeEvent {
            key: "_reload".to_string(),
            value: Value::String("reloaded".to_string()),
            old_value: None,
            timestamp: Utc::now(),
            source: "config_manager".to_string(),
            metadata: HashMap::new(),
        });

        Ok(())
    }

    pub async fn validate(&self) -> Result<Vec<ValidationError>> {
        Ok(self.get_config().await?.validate())
    }

    async fn merge_configurations(&self) -> Result<()> {
        let mut merged = serde_json::to_value(AppConfig::default())?;

        for layer in &self.layers {
            let layer_config = load_layer_config(layer)?;
            merge_values(&mut merged, layer_config);
            tracing::debug!(layer = %layer.name, priority = layer.priority, "Merged config layer");
        }

        *self.merged_config.write().await = merged;
        Ok(())
    }

    pub async fn debug_config(&self) -> Value {
        self.merged_config.read().await.clone()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn load_layer_config(layer: &ConfigLayer) -> Result<Value> {
    match &layer.source {
        ConfigSource::File { path, format } => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            format.parse(&content)
        }
        ConfigSource::Environment { prefix } => Ok(env_layer(prefix, std::env::vars())),
        ConfigSource::Memory { data } => Ok(data.clone()),
    }
}

/// Builds a config tree from `PREFIX__SECTION__KEY=value` pairs
fn env_layer(prefix: &str, vars: impl Iterator<Item = (String, String)>) -> Value {
    let mut env_config = Map::new();
    let full_prefix = format!("{}{}", prefix, ENV_SEPARATOR);

    for (key, value) in vars {
        let Some(rest) = key.strip_prefix(&full_prefix) else {
            continue;
        };
        let nested_keys: Vec<String> = rest
            .split(ENV_SEPARATOR)
            .filter(|k| !k.is_empty())
            .map(str::to_lowercase)
            .collect();
        set_nested_env_value(&mut env_config, &nested_keys, value);
    }

    Value::Object(env_config)
}

fn set_nested_env_value(config: &mut Map<String, Value>, keys: &[String], value: String) {
    let Some((first, rest)) = keys.split_first() else {
        return;
    };

    if rest.is_empty() {
        let parsed_value = if let Ok(bool_val) = value.parse::<bool>() {
            Value::Bool(bool_val)
        } else if let Ok(int_val) = value.parse::<i64>() {
            Value::Number(Number::from(int_val))
        } else if let Some(float_val) = value.parse::<f64>().ok().and_then(Number::from_f64) {
            Value::Number(float_val)
        } else {
            Value::String(value)
        };
        config.insert(first.clone(), parsed_value);
        return;
    }

    let entry = config
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(nested_map) = entry {
        set_nested_env_value(nested_map, rest, value);
    }
}

fn merge_values(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(&key) {
                    Some(target_value) => merge_values(target_value, source_value),
                    None => {
                        target_map.insert(key, source_value);
                    }
                }
            }
        }
        (target, source) => {
            *target = source;
        }
    }
}

fn get_nested_value(config: &Value, key: &str) -> Option<Value> {
    let mut current = config;
    for k in key.split('.') {
        current = current.get(k)?;
    }
    Some(current.clone())
}

fn set_nested_value(config: &mut Value, key: &str, value: Value) {
    let keys: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = keys.split_last() else {
        return;
    };

    let mut current = config;
    for k in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(k.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

#[async_trait]
impl Manager for ConfigManager {
    fn name(&self) -> &str {
        "config_manager"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        let env_prefix = self.env_prefix.clone();
        self.add_env_layer("environment", env_prefix, 1000);

        if let Err(e) = self.merge_configurations().await {
            self.state.set_state(ManagerState::Error).await;
            return Err(e);
        }

        let errors = self.validate().await?;
        if !errors.is_empty() {
            self.state.set_state(ManagerState::Error).await;
            return Err(Error::new(
                crate::error::ErrorKind::Configuration {
                    key: None,
                    validation_errors: errors.iter().map(ToString::to_string).collect(),
                },
                format!("{} configuration value(s) failed validation", errors.len()),
            )
            .source("config_manager"));
        }

        self.state.set_state(ManagerState::Running).await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;
        self.state.set_state(ManagerState::Shutdown).await;
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        status.add_metadata("layers", Value::from(self.layers.len()));
        status.add_metadata("env_prefix", Value::String(self.env_prefix.clone()));
        status
    }

    async fn get_config(&self) -> Option<Value> {
        Some(self.debug_config().await)
    }

    async fn update_config(&mut self, config: Value) -> Result<()> {
        let priority = self.layers.last().map(|l| l.priority + 1).unwrap_or(500);
        self.add_memory_layer("runtime", config, priority);
        self.merge_configurations().await.map_err(|e| {
            Error::manager(self.name(), ManagerOperation::Configure, e.message.clone()).caused_by(e)
        })
    }
}
