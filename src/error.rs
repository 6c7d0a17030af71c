// src/error.rs - Error handling for the control protocol and lifecycle layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

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
    /// Malformed event or payload body.
    Codec {
        event_type: Option<String>,
        reason: String,
    },
    /// Wire tag outside the closed set of event or data types.
    UnknownType {
        tag: String,
    },
    NoTarget {
        event_id: u64,
    },
    Transport {
        destination: Option<String>,
        operation: TransportOperation,
    },
    Correlation {
        event_id: u64,
    },
    Lifecycle {
        instance_id: String,
        operation: LifecycleOperation,
    },
    Application,
    Io,
    Serialization,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerOperation {
    Initialize,
    Shutdown,
    Configure,
    Register,
    Unregister,
    Operation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportOperation {
    EnableDestination,
    CreatePublisher,
    Subscribe,
    Publish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleOperation {
    Launch,
    Stop,
    Kill,
    Transition,
    Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub severity: ErrorSeverity,
    pub source: String,
    pub correlation_id: Option<u64>,
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

    /// Sets the error severity
    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the error source
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Sets the correlation (request event) ID
    pub fn correlation_id(mut self, correlation_id: u64) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Adds metadata to the error
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Adds a cause to the error chain
    pub fn caused_by(mut self, cause: impl fmt::Display) -> Self {
        self.causes.push(cause.to_string());
        self
    }

    /// Checks if the error is critical
    pub fn is_critical(&self) -> bool {
        matches!(self.severity, ErrorSeverity::Critical)
    }

    /// Creates a configuration error
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

    /// Creates a manager operation error
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

    /// Creates a codec error for a malformed body
    pub fn codec(event_type: Option<&str>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorKind::Codec {
                event_type: event_type.map(str::to_string),
                reason: reason.clone(),
            },
            format!("Failed to decode body: {}", reason),
        )
    }

    /// Creates an unknown-type error
    pub fn unknown_type(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self::new(
            ErrorKind::UnknownType { tag: tag.clone() },
            format!("No such type: {}", tag),
        )
        .severity(ErrorSeverity::Low)
    }

    /// Creates a no-target error
    pub fn no_target(event_id: u64) -> Self {
        Self::new(
            ErrorKind::NoTarget { event_id },
            "No target specified for event",
        )
    }

    /// Creates a transport error
    pub fn transport(
        destination: Option<&str>,
        operation: TransportOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Transport {
                destination: destination.map(str::to_string),
                operation,
            },
            message,
        )
        .severity(ErrorSeverity::High)
    }

    /// Creates a correlation bookkeeping error
    pub fn correlation(event_id: u64, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Correlation { event_id }, message).correlation_id(event_id)
    }

    /// Creates a lifecycle error scoped to one instance
    pub fn lifecycle(
        instance_id: impl Into<String>,
        operation: LifecycleOperation,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::Lifecycle {
                instance_id: instance_id.into(),
                operation,
            },
            message,
        )
    }

    /// Creates a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}): {}",
            self.severity, self.source, self.id, self.message
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let msg = err.to_string();

        let mut error = Error::new(ErrorKind::Io, msg);
        error.source = "std::io::Error".to_string();
        error.severity = ErrorSeverity::High;

        error
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Serialization, err.to_string()).source("serde_json")
    }
}

/// Extension trait for Results to add context
pub trait ResultExt<T> {
    /// Adds context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Sets the error source
    fn with_source(self, source: impl Into<String>) -> Result<T>;

    /// Sets the correlation ID
    fn with_correlation(self, correlation_id: u64) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::new(ErrorKind::Application, f()).caused_by(e))
    }

    fn with_source(self, source: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            Error::new(ErrorKind::Application, e.to_string())
                .source(source)
                .caused_by(e)
        })
    }

    fn with_correlation(self, correlation_id: u64) -> Result<T> {
        self.map_err(|e| {
            Error::new(ErrorKind::Application, e.to_string())
                .correlation_id(correlation_id)
                .caused_by(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = Error::config("Invalid configuration value")
            .source("config_manager")
            .metadata(
                "key",
                serde_json::Value::String("ccp.inbound_destination".to_string()),
            );

        assert_eq!(error.severity, ErrorSeverity::High);
        assert_eq!(error.source, "config_manager");
        assert!(matches!(error.kind, ErrorKind::Configuration { .. }));
        assert!(error.metadata.contains_key("key"));
    }

    #[test]
    fn test_unknown_type_error() {
        let error = Error::unknown_type("UNKNOWN_TYPE");
        assert_eq!(
            error.kind,
            ErrorKind::UnknownType {
                tag: "UNKNOWN_TYPE".to_string()
            }
        );
        assert_eq!(error.severity, ErrorSeverity::Low);
        assert!(error.message.contains("UNKNOWN_TYPE"));
    }

    #[test]
    fn test_correlation_error_carries_event_id() {
        let error = Error::correlation(42, "duplicate registration");
        assert_eq!(error.correlation_id, Some(42));
        assert!(matches!(error.kind, ErrorKind::Correlation { event_id: 42 }));
    }

    #[test]
    fn test_result_ext_context() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "pipe closed"));
        let error = io
            .with_context(|| "Failed to spawn component".to_string())
            .unwrap_err();
        assert_eq!(error.message, "Failed to spawn component");
        assert_eq!(error.causes, vec!["pipe closed".to_string()]);
    }
}
