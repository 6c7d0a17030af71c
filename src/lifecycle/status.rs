// src/lifecycle/status.rs

//! Instance statuses and the audit trail every transition leaves behind.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::logging::Logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Created,
    Bounding,
    Bound,
    Unbound,
    UnboundByPolicy,
    FailedToLaunch,
    FailedToKill,
}

impl LifecycleStatus {
    /// Whether the instance is launching or up
    pub fn is_active(self) -> bool {
        matches!(self, Self::Bounding | Self::Bound)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Bounding => write!(f, "BOUNDING"),
            Self::Bound => write!(f, "BOUND"),
            Self::Unbound => write!(f, "UNBOUND"),
            Self::UnboundByPolicy => write!(f, "UNBOUND_BY_POLICY"),
            Self::FailedToLaunch => write!(f, "FAILED_TO_LAUNCH"),
            Self::FailedToKill => write!(f, "FAILED_TO_KILL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    Info,
    Warning,
    Error,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Record of one accepted lifecycle transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub status: LifecycleStatus,
    pub category: AuditCategory,
    pub description: String,
    pub instance_id: String,
    pub application_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Receives audit events; called with the handle's lock held, so keep it short
pub trait AuditSink: Send + Sync + fmt::Debug {
    fn raise_event(&self, event: AuditEvent);
}

/// Writes audit events to the log
#[derive(Debug, Clone)]
pub struct TracingAuditSink {
    logger: Logger,
}

impl TracingAuditSink {
    pub fn new() -> Self {
        Self {
            logger: Logger::new("lifecycle.audit"),
        }
    }
}

impl Default for TracingAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for TracingAuditSink {
    fn raise_event(&self, event: AuditEvent) {
        let line = format!(
            "{}__{} -> {}: {}",
            event.application_id, event.instance_id, event.status, event.description
        );
        match event.category {
            AuditCategory::Info => self.logger.info(line),
            AuditCategory::Warning => self.logger.warn(line),
            AuditCategory::Error => self.logger.error(line),
        }
    }
}

/// Keeps every audit event for later inspection
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<LifecycleStatus> {
        self.events.lock().iter().map(|event| event.status).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn raise_event(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(LifecycleStatus::UnboundByPolicy.to_string(), "UNBOUND_BY_POLICY");
        assert_eq!(
            serde_json::to_string(&LifecycleStatus::FailedToKill).unwrap(),
            "\"FAILED_TO_KILL\""
        );
        assert!(LifecycleStatus::Bounding.is_active());
        assert!(!LifecycleStatus::Unbound.is_active());
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryAuditSink::new();
        for status in [LifecycleStatus::Bounding, LifecycleStatus::Bound] {
            sink.raise_event(AuditEvent {
                status,
                category: AuditCategory::Info,
                description: String::new(),
                instance_id: "comp1".to_string(),
                application_id: "App1".to_string(),
                timestamp: Utc::now(),
            });
        }
        assert_eq!(
            sink.statuses(),
            vec![LifecycleStatus::Bounding, LifecycleStatus::Bound]
        );
        sink.clear();
        assert!(sink.is_empty());
    }
}
