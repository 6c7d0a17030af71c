// src/config/mod.rs

//! Layered configuration
//!
//! Layers are merged in priority order, lowest first:
//! - Built-in defaults (priority 0)
//! - Configuration files (YAML, JSON, TOML)
//! - In-memory overrides
//! - Environment variables with the configured prefix (priority 1000)
//!
//! Environment keys nest on a double underscore, so
//! `CCP_CCP__DEFAULT_PRIORITY=7` sets `ccp.default_priority`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::ccp::{DEFAULT_PRIORITY, PROTOCOL_VERSION};
use crate::error::{Error, ErrorKind, Result};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};
use crate::types::Metadata;
use crate::utils::Time;

/// Default environment prefix
pub const ENV_PREFIX: &str = "CCP";

const ENV_NESTING: &str = "__";

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

impl ValidationError {
    fn new(key: &str, message: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            message: message.into(),
        }
    }
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
    pub ccp: CcpConfig,
    pub lifecycle: LifecycleConfig,
}

impl AppConfig {
    /// Checks cross-field constraints the types cannot express
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let ccp = &self.ccp;

        if ccp.outbound_destination.trim().is_empty() {
            errors.push(ValidationError::new("ccp.outbound_destination", "must not be empty"));
        }
        if ccp.inbound_destination.trim().is_empty() {
            errors.push(ValidationError::new("ccp.inbound_destination", "must not be empty"));
        }
        if ccp.outbound_destination == ccp.inbound_destination {
            errors.push(ValidationError::new(
                "ccp.inbound_destination",
                "must differ from ccp.outbound_destination",
            ));
        }
        if !(0..=9).contains(&ccp.default_priority) {
            errors.push(ValidationError::new(
                "ccp.default_priority",
                format!("{} is outside 0..=9", ccp.default_priority),
            ));
        }
        if ccp.default_request_timeout_ms == 0 {
            errors.push(ValidationError::new("ccp.default_request_timeout_ms", "must be positive"));
        }
        if ccp.control_plane_id.trim().is_empty() {
            errors.push(ValidationError::new("ccp.control_plane_id", "must not be empty"));
        }
        if self.lifecycle.request_timeout_ms == 0 {
            errors.push(ValidationError::new("lifecycle.request_timeout_ms", "must be positive"));
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
    pub debug: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: "esb-control-plane".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            debug: cfg!(debug_assertions),
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

/// Daily-rolling log file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    pub path: PathBuf,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logs/ccp.log"),
        }
    }
}

/// Control protocol endpoints and envelope defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcpConfig {
    /// Topic the control plane publishes to; components filter on their id
    pub outbound_destination: String,
    /// Topic components publish to; the control plane is its sole subscriber
    pub inbound_destination: String,
    pub protocol_version: f32,
    pub default_priority: i32,
    pub default_request_timeout_ms: u64,
    /// Stamped as target on component-originated traffic
    pub control_plane_id: String,
}

impl Default for CcpConfig {
    fn default() -> Self {
        Self {
            outbound_destination: "ccp.components".to_string(),
            inbound_destination: "ccp.control".to_string(),
            protocol_version: PROTOCOL_VERSION,
            default_priority: DEFAULT_PRIORITY,
            default_request_timeout_ms: 5_000,
            control_plane_id: "control_plane".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Deadline for CCP requests issued on behalf of a launch mechanism
    pub request_timeout_ms: u64,
    /// How long a graceful stop may take before it counts as failed
    pub kill_grace_period_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            kill_grace_period_ms: 10_000,
        }
    }
}

pub struct ConfigManager {
    state: ManagedState,
    layers: Vec<ConfigLayer>,
    merged_config: Arc<RwLock<Value>>,
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
        let defaults = serde_json::to_value(AppConfig::default())
            .unwrap_or_else(|_| Value::Object(Map::new()));

        Self {
            state: ManagedState::new(Uuid::new_v4(), "config_manager"),
            layers: vec![ConfigLayer {
                name: "defaults".to_string(),
                source: ConfigSource::Memory { data: defaults },
                priority: 0,
            }],
            merged_config: Arc::new(RwLock::new(Value::Object(Map::new()))),
            change_notifier,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    pub fn with_config_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut manager = Self::new();
        manager.add_file_layer("file", config_path, 10)?;
        Ok(manager)
    }

    /// Replaces the prefix of the environment layer added at initialization
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

    /// Overrides one dotted key in the merged view and notifies subscribers
    pub async fn set<T>(&self, key: &str, value: T) -> Result<()>
    where
        T: Serialize,
    {
        let serialized_value = serde_json::to_value(value).map_err(|e| {
            Error::new(
                ErrorKind::Configuration {
                    key: Some(key.to_string()),
                    validation_errors: vec![format!("Failed to serialize config value: {}", e)],
                },
                format!("Failed to serialize config value: {}", e),
            )
        })?;

        let old_value = {
            let mut config = self.merged_config.write().await;
            let old_value = get_nested_value(&config, key);
            set_nested_value(&mut config, key, serialized_value.clone());
            old_value
        };

        let change_event = ConfigChangeEvent {
            key: key.to_string(),
            value: serialized_value,
            old_value,
            timestamp: Time::now(),
            source: "config_manager".to_string(),
            metadata: HashMap::new(),
        };
        tracing::debug!("Configuration key '{}' updated", key);
        let _ = self.change_notifier.send(change_event);

        Ok(())
    }

    pub async fn get<T>(&self, key: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let config = self.merged_config.read().await;
        let value = get_nested_value(&config, key).ok_or_else(|| {
            Error::new(
                ErrorKind::Configuration {
                    key: Some(key.to_string()),
                    validation_errors: vec![format!("Configuration key '{}' not found", key)],
                },
                "Configuration key not found",
            )
        })?;

        serde_json::from_value(value).map_err(|e| {
            Error::new(
                ErrorKind::Configuration {
                    key: Some(key.to_string()),
                    validation_errors: vec![format!("Failed to deserialize config value: {}", e)],
                },
                format!("Failed to deserialize config value: {}", e),
            )
        })
    }

    /// Typed view of the merged configuration
    pub async fn get_config(&self) -> Result<AppConfig> {
        let config = self.merged_config.read().await;
        serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("Failed to deserialize config: {}", e)))
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_notifier.subscribe()
    }

    /// Re-reads every layer. Values written with [`set`](Self::set) are lost.
    pub async fn reload(&self) -> Result<()> {
        self.merge_configurations().await?;

        let reload_event = ConfigChangeEvent {
            key: "_reload".to_string(),
            value: Value::String("reloaded".to_string()),
            old_value: None,
            timestamp: Time::now(),
            source: "config_manager".to_string(),
            metadata: HashMap::new(),
        };
        let _ = self.change_notifier.send(reload_event);

        Ok(())
    }

    pub async fn validate(&self) -> Result<Vec<ValidationError>> {
        Ok(self.get_config().await?.validate())
    }

    async fn merge_configurations(&self) -> Result<()> {
        let mut merged = Value::Object(Map::new());

        for layer in &self.layers {
            let layer_config = self.load_layer_config(layer).await?;
            merge_values(&mut merged, layer_config);
        }

        *self.merged_config.write().await = merged;
        Ok(())
    }

    async fn load_layer_config(&self, layer: &ConfigLayer) -> Result<Value> {
        match &layer.source {
            ConfigSource::File { path, format } => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to read config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;

                match format {
                    ConfigFormat::Json => serde_json::from_str(&content)
                        .map_err(|e| Error::config(format!("Failed to parse JSON config: {}", e))),
                    ConfigFormat::Yaml => serde_yaml::from_str(&content)
                        .map_err(|e| Error::config(format!("Failed to parse YAML config: {}", e))),
                    ConfigFormat::Toml => toml::from_str(&content)
                        .map_err(|e| Error::config(format!("Failed to parse TOML config: {}", e))),
                }
            }

            ConfigSource::Environment { prefix } => {
                let mut env_config = Map::new();
                for (key, value) in std::env::vars() {
                    let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                        continue;
                    };
                    let Some(rest) = rest.strip_prefix('_') else {
                        continue;
                    };
                    let config_key = rest.to_lowercase();
                    let nested_keys: Vec<&str> = config_key.split(ENV_NESTING).collect();
                    set_nested_env_value(&mut env_config, &nested_keys, value);
                }
                Ok(Value::Object(env_config))
            }

            ConfigSource::Memory { data } => Ok(data.clone()),
        }
    }

    pub async fn debug_config(&self) -> Value {
        self.merged_config.read().await.clone()
    }

    pub fn get_metadata(&self) -> Value {
        serde_json::json!({
            "layers": self.layers.iter().map(|l| {
                serde_json::json!({
                    "name": l.name,
                    "priority": l.priority,
                    "source": match &l.source {
                        ConfigSource::File { path, .. } => path.display().to_string(),
                        ConfigSource::Environment { prefix } => format!("env:{}", prefix),
                        ConfigSource::Memory { .. } => "memory".to_string(),
                    }
                })
            }).collect::<Vec<_>>(),
            "env_prefix": self.env_prefix.clone()
        })
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
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
    let mut current = config;
    let mut keys = key.split('.').peekable();

    while let Some(k) = keys.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if keys.peek().is_none() {
            map.insert(k.to_string(), value);
            return;
        }
        current = map
            .entry(k.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn set_nested_env_value(config: &mut Map<String, Value>, keys: &[&str], value: String) {
    match keys {
        [] => {}
        [last] => {
            config.insert(last.to_string(), parse_env_value(value));
        }
        [first, rest @ ..] => {
            let entry = config
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(nested_map) = entry {
                set_nested_env_value(nested_map, rest, value);
            }
        }
    }
}

fn parse_env_value(value: String) -> Value {
    if let Ok(bool_val) = value.parse::<bool>() {
        Value::Bool(bool_val)
    } else if let Ok(int_val) = value.parse::<i64>() {
        Value::Number(Number::from(int_val))
    } else if let Some(float_val) = value
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
    {
        Value::Number(float_val)
    } else {
        Value::String(value)
    }
}

#[async_trait]
impl Manager for ConfigManager {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        let env_prefix = self.env_prefix.clone();
        if !self.layers.iter().any(|l| l.name == "environment") {
            self.add_env_layer("environment", env_prefix, 1000);
        }

        if let Err(e) = self.merge_configurations().await {
            self.state.set_state(ManagerState::Error).await;
            return Err(e);
        }

        let errors = self.validate().await?;
        if !errors.is_empty() {
            self.state.set_state(ManagerState::Error).await;
            return Err(Error::new(
                ErrorKind::Configuration {
                    key: errors.first().map(|e| e.key.clone()),
                    validation_errors: errors.iter().map(ToString::to_string).collect(),
                },
                format!("{} invalid configuration values", errors.len()),
            ));
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn temp_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_defaults_only() {
        let mut manager = ConfigManager::new().with_env_prefix("CCP_TEST_DEFAULTS");
        manager.initialize().await.unwrap();

        let config = manager.get_config().await.unwrap();
        assert_eq!(config.ccp, CcpConfig::default());
        let outbound: String = manager.get("ccp.outbound_destination").await.unwrap();
        assert_eq!(outbound, "ccp.components");
    }

    #[tokio::test]
    async fn test_yaml_file_layer() {
        let file = temp_config(
            ".yaml",
            "ccp:\n  inbound_destination: \"bus.control\"\n  default_priority: 7\n",
        );
        let mut manager = ConfigManager::with_config_file(file.path())
            .unwrap()
            .with_env_prefix("CCP_TEST_YAML");
        manager.initialize().await.unwrap();

        let config = manager.get_config().await.unwrap();
        assert_eq!(config.ccp.inbound_destination, "bus.control");
        assert_eq!(config.ccp.default_priority, 7);
        assert_eq!(config.ccp.outbound_destination, "ccp.components");
    }

    #[tokio::test]
    async fn test_toml_file_layer() {
        let file = temp_config(".toml", "[lifecycle]\nrequest_timeout_ms = 250\n");
        let mut manager = ConfigManager::with_config_file(file.path())
            .unwrap()
            .with_env_prefix("CCP_TEST_TOML");
        manager.initialize().await.unwrap();

        let timeout: u64 = manager.get("lifecycle.request_timeout_ms").await.unwrap();
        assert_eq!(timeout, 250);
    }

    #[tokio::test]
    async fn test_unsupported_extension() {
        assert!(ConfigManager::with_config_file("settings.ini").is_err());
    }

    #[tokio::test]
    async fn test_environment_layer_wins() {
        std::env::set_var("CCP_TEST_ENV_CCP__CONTROL_PLANE_ID", "cp-east");
        std::env::set_var("CCP_TEST_ENV_APP__DEBUG", "false");

        let mut manager = ConfigManager::new().with_env_prefix("CCP_TEST_ENV");
        manager.add_memory_layer(
            "memory",
            serde_json::json!({ "ccp": { "control_plane_id": "cp-memory" } }),
            50,
        );
        manager.initialize().await.unwrap();

        let config = manager.get_config().await.unwrap();
        assert_eq!(config.ccp.control_plane_id, "cp-east");
        assert!(!config.app.debug);

        std::env::remove_var("CCP_TEST_ENV_CCP__CONTROL_PLANE_ID");
        std::env::remove_var("CCP_TEST_ENV_APP__DEBUG");
    }

    #[tokio::test]
    async fn test_invalid_values_fail_initialization() {
        let mut manager = ConfigManager::new().with_env_prefix("CCP_TEST_INVALID");
        manager.add_memory_layer(
            "memory",
            serde_json::json!({ "ccp": { "inbound_destination": "ccp.components", "default_priority": 12 } }),
            50,
        );

        let error = manager.initialize().await.unwrap_err();
        match error.kind {
            ErrorKind::Configuration {
                validation_errors, ..
            } => assert_eq!(validation_errors.len(), 2),
            other => panic!("unexpected error kind {:?}", other),
        }
        assert_eq!(manager.state.state().await, ManagerState::Error);
    }

    #[tokio::test]
    async fn test_set_notifies_subscribers() {
        let mut manager = ConfigManager::new().with_env_prefix("CCP_TEST_SET");
        manager.initialize().await.unwrap();
        let mut changes = manager.subscribe_to_changes();

        manager.set("ccp.default_priority", 9).await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "ccp.default_priority");
        assert_eq!(change.value, serde_json::json!(9));
        assert_eq!(change.old_value, Some(serde_json::json!(DEFAULT_PRIORITY)));
        let priority: i32 = manager.get("ccp.default_priority").await.unwrap();
        assert_eq!(priority, 9);
    }

    #[test]
    fn test_set_nested_value_creates_objects() {
        let mut value = Value::Object(Map::new());
        set_nested_value(&mut value, "a.b.c", Value::from(1));
        assert_eq!(get_nested_value(&value, "a.b.c"), Some(Value::from(1)));
    }
}
