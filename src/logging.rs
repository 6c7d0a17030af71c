// src/logging.rs

//! Structured logging
//!
//! Installs a `tracing` subscriber with a reloadable level filter, a console
//! layer, an optional daily-rolling file layer and a counting layer whose
//! totals show up in the manager status. Per-logger levels can be changed at
//! runtime, which is what a component does when it receives `SET_LOG_LEVEL`.

use std::collections::{BTreeMap, HashMap};
use std::fmt as stdfmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{Dispatch, Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::Identity;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, EnvFilter, Layer, Registry};
use uuid::Uuid;

use crate::ccp::LogLevel;
use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, ManagerOperation, Result, ResultExt};
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};

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

impl LogLevel {
    /// `None` for [`LogLevel::Off`]
    pub fn to_tracing(self) -> Option<tracing::Level> {
        match self {
            Self::Trace => Some(tracing::Level::TRACE),
            Self::Debug => Some(tracing::Level::DEBUG),
            Self::Info => Some(tracing::Level::INFO),
            Self::Warn => Some(tracing::Level::WARN),
            Self::Error => Some(tracing::Level::ERROR),
            Self::Off => None,
        }
    }

    /// Level name as accepted by `EnvFilter` directives
    pub fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

/// Builds an `EnvFilter` directive string: base level, then one entry per logger
pub fn filter_directives(base: &str, levels: &BTreeMap<String, LogLevel>) -> String {
    levels
        .iter()
        .fold(base.to_string(), |mut directives, (logger, level)| {
            directives.push(',');
            directives.push_str(logger);
            directives.push('=');
            directives.push_str(level.directive());
            directives
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub total_entries: u64,
    pub entries_by_level: BTreeMap<LogLevel, u64>,
}

#[derive(Debug, Default)]
struct LevelCounts {
    trace: AtomicU64,
    debug: AtomicU64,
    info: AtomicU64,
    warn: AtomicU64,
    error: AtomicU64,
}

impl LevelCounts {
    fn counter(&self, level: LogLevel) -> Option<&AtomicU64> {
        match level {
            LogLevel::Trace => Some(&self.trace),
            LogLevel::Debug => Some(&self.debug),
            LogLevel::Info => Some(&self.info),
            LogLevel::Warn => Some(&self.warn),
            LogLevel::Error => Some(&self.error),
            LogLevel::Off => None,
        }
    }

    fn snapshot(&self) -> LogStats {
        let mut stats = LogStats::default();
        for level in LogLevel::ALL {
            if let Some(counter) = self.counter(*level) {
                let count = counter.load(Ordering::Relaxed);
                stats.total_entries += count;
                stats.entries_by_level.insert(*level, count);
            }
        }
        stats
    }
}

/// Counts every event that passes the filter
#[derive(Debug, Clone, Default)]
struct CountingLayer {
    counts: Arc<LevelCounts>,
}

impl<S> Layer<S> for CountingLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = LogLevel::from(*event.metadata().level());
        if let Some(counter) = self.counts.counter(level) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Main logging manager
pub struct LoggingManager {
    state: ManagedState,
    config: LoggingConfig,
    counting_layer: CountingLayer,
    filter: Option<FilterHandle>,
    overrides: Mutex<BTreeMap<String, LogLevel>>,
    dispatch: Option<Dispatch>,
    installed: bool,
    _guards: Vec<WorkerGuard>,
}

impl stdfmt::Debug for LoggingManager {
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
        f.debug_struct("LoggingManager")
            .field("state", &self.state)
            .field("level", &self.config.level)
            .field("installed", &self.installed)
            .finish()
    }
}

impl LoggingManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "logging_manager"),
            config,
            counting_layer: CountingLayer::default(),
            filter: None,
            overrides: Mutex::new(BTreeMap::new()),
            dispatch: None,
            installed: false,
            _guards: Vec::new(),
        }
    }

    /// Whether this manager's subscriber became the global default
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    fn setup_tracing(&mut self) -> Result<()> {
        let base = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.config.level))
            .map_err(|e| Error::config(format!("Invalid log level '{}': {}", self.config.level, e)))?;
        let (filter, handle) = reload::Layer::new(base);

        let registry = Registry::default().with(filter);

        let registry = if self.config.console.enabled {
            let console_layer = fmt::layer()
                .with_ansi(self.config.console.colored)
                .with_target(true)
                .with_line_number(true)
                .boxed();
            registry.with(console_layer)
        } else {
            registry.with(Identity::new().boxed())
        };

        let registry = if let Some(file_config) = &self.config.file {
            let directory = file_config
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."));
            let file_name = file_config
                .path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("ccp.log"));
            let file_appender = tracing_appender::rolling::daily(directory, file_name);

            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            self._guards.push(guard);

            let file_layer = match self.config.format {
                LogFormat::Json => fmt::layer().json().with_writer(non_blocking).boxed(),
                LogFormat::Pretty => fmt::layer().pretty().with_writer(non_blocking).boxed(),
                LogFormat::Compact => fmt::layer().compact().with_writer(non_blocking).boxed(),
            };
            registry.with(file_layer)
        } else {
            registry.with(Identity::new().boxed())
        };

        let registry = registry.with(self.counting_layer.clone());

        // Another subscriber may already be global; the dispatch is kept so
        // the reload handle stays valid either way.
        let dispatch = Dispatch::new(registry);
        self.installed = tracing::dispatcher::set_global_default(dispatch.clone()).is_ok();
        self.dispatch = Some(dispatch);
        self.filter = Some(handle);
        Ok(())
    }

    /// Applies per-logger levels on top of the configured base level
    pub fn set_log_levels(&self, levels: &BTreeMap<String, LogLevel>) -> Result<()> {
        let handle = self.filter.as_ref().ok_or_else(|| {
            Error::manager(
                self.state.name(),
                ManagerOperation::Configure,
                "Logging is not initialized",
            )
        })?;

        let mut overrides = self.overrides.lock();
        let mut merged = overrides.clone();
        merged.extend(levels.iter().map(|(logger, level)| (logger.clone(), *level)));

        let directives = filter_directives(&self.config.level, &merged);
        let filter = EnvFilter::try_new(&directives)
            .map_err(|e| Error::config(format!("Invalid log directives '{}': {}", directives, e)))?;
        handle
            .reload(filter)
            .with_context(|| "Failed to reload log filter".to_string())?;

        *overrides = merged;
        tracing::info!("Log levels updated: {}", directives);
        Ok(())
    }

    /// Levels set at runtime, optionally narrowed to `loggers`
    pub fn log_levels(&self, loggers: &[String]) -> BTreeMap<String, LogLevel> {
        let overrides = self.overrides.lock();
        if loggers.is_empty() {
            return overrides.clone();
        }
        loggers
            .iter()
            .filter_map(|logger| overrides.get(logger).map(|level| (logger.clone(), *level)))
            .collect()
    }

    pub fn get_stats(&self) -> LogStats {
        self.counting_layer.counts.snapshot()
    }

    pub fn create_logger(&self, component: impl Into<String>) -> Logger {
        Logger::new(component)
    }
}

#[async_trait]
impl Manager for LoggingManager {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        if let Some(file_config) = &self.config.file {
            if let Some(parent) = file_config.path.parent() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
        }

        self.setup_tracing()?;

        self.state.set_state(ManagerState::Running).await;
        tracing::info!("Logging manager initialized");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;
        tracing::info!("Shutting down logging manager");
        // Dropping the guards flushes the file writer.
        self._guards.clear();
        self.state.set_state(ManagerState::Shutdown).await;
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let stats = self.get_stats();

        status.add_metadata("total_entries", serde_json::Value::from(stats.total_entries));
        status.add_metadata("installed", serde_json::Value::Bool(self.installed));
        status.add_metadata("file_logging", serde_json::Value::Bool(self.config.file.is_some()));
        status.add_metadata("console_logging", serde_json::Value::Bool(self.config.console.enabled));
        status.add_metadata("log_level", serde_json::Value::String(self.config.level.clone()));

        status
    }
}

/// Component-scoped logger that tags every line with its context
#[derive(Debug, Clone)]
pub struct Logger {
    component: String,
    correlation_id: Option<u64>,
    metadata: HashMap<String, serde_json::Value>,
}

impl Logger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            correlation_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Tags lines with the CCP event id they relate to
    pub fn with_correlation_id(mut self, correlation_id: u64) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message.as_ref());
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let correlation = self.correlation_id.unwrap_or_default();
        let metadata = if self.metadata.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&self.metadata).unwrap_or_default()
        };

        match level {
            LogLevel::Trace => tracing::trace!(component = %self.component, correlation, %metadata, "{}", message),
            LogLevel::Debug => tracing::debug!(component = %self.component, correlation, %metadata, "{}", message),
            LogLevel::Info => tracing::info!(component = %self.component, correlation, %metadata, "{}", message),
            LogLevel::Warn => tracing::warn!(component = %self.component, correlation, %metadata, "{}", message),
            LogLevel::Error => tracing::error!(component = %self.component, correlation, %metadata, "{}", message),
            LogLevel::Off => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let mut levels = BTreeMap::new();
        levels.insert("esb_ccp::ccp".to_string(), LogLevel::Debug);
        levels.insert("esb_ccp::transport".to_string(), LogLevel::Off);
        assert_eq!(
            filter_directives("info", &levels),
            "info,esb_ccp::ccp=debug,esb_ccp::transport=off"
        );
        assert!(EnvFilter::try_new(filter_directives("info", &levels)).is_ok());
    }

    #[test]
    fn test_level_conversions() {
        assert_eq!(LogLevel::from(tracing::Level::WARN), LogLevel::Warn);
        assert_eq!(LogLevel::Debug.to_tracing(), Some(tracing::Level::DEBUG));
        assert_eq!(LogLevel::Off.to_tracing(), None);
    }

    #[tokio::test]
    async fn test_logging_manager_lifecycle() {
        let mut manager = LoggingManager::new(LoggingConfig::default());
        assert!(manager.set_log_levels(&BTreeMap::new()).is_err());

        manager.initialize().await.unwrap();
        let status = manager.status().await;
        assert_eq!(status.state, ManagerState::Running);

        let mut levels = BTreeMap::new();
        levels.insert("esb_ccp::lifecycle".to_string(), LogLevel::Trace);
        manager.set_log_levels(&levels).unwrap();
        assert_eq!(manager.log_levels(&[]), levels);
        assert_eq!(
            manager.log_levels(&["missing".to_string()]),
            BTreeMap::new()
        );

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LoggingConfig::default();
        config.console.enabled = false;
        config.file = Some(crate::config::FileLogConfig {
            path: dir.path().join("nested").join("ccp.log"),
        });

        let mut manager = LoggingManager::new(config);
        manager.initialize().await.unwrap();
        assert!(dir.path().join("nested").is_dir());
        manager.shutdown().await.unwrap();
    }

    #[test]
    fn test_logger_with_context() {
        let logger = Logger::new("lifecycle")
            .with_correlation_id(42)
            .with_metadata("instance", serde_json::Value::String("App1__comp1".to_string()));
        assert_eq!(logger.component(), "lifecycle");
        logger.info("context attached");
        logger.log(LogLevel::Off, "never emitted");
    }
}
