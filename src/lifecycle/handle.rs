// src/lifecycle/handle.rs

//! Per-instance lifecycle state machine.
//!
//! ```text
//! CREATED ─┐
//! UNBOUND ─┼─ begin_launch ─> BOUNDING ─ confirm_launch ─> BOUND
//! FAILED_* ┘                     │  ^                        │
//!                                │  └──────── restart ───────┤
//!                                └─ mark_stopped / kill_failed / by_policy
//! ```
//!
//! Every accepted transition raises exactly one audit event while the
//! handle's lock is held, so audit order matches transition order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, LifecycleOperation, Result};
use crate::lifecycle::status::{AuditCategory, AuditEvent, AuditSink, LifecycleStatus};
use crate::types::ServiceInstanceId;
use crate::utils::Time;

/// How to start one component instance; fixed for the life of its handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfiguration {
    pub instance_id: ServiceInstanceId,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub component_version: String,
    /// Container image, only used by container launches
    pub image: Option<String>,
}

impl LaunchConfiguration {
    pub fn new(instance_id: ServiceInstanceId) -> Self {
        Self {
            instance_id,
            executable: PathBuf::new(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            working_dir: None,
            component_version: "1.0.0".to_string(),
            image: None,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.component_version = version.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Point-in-time copy of a handle's fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSnapshot {
    pub instance_id: String,
    pub application_id: String,
    pub status: LifecycleStatus,
    pub last_launch: Option<DateTime<Utc>>,
    pub last_kill: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    pub graceful_kill: bool,
    pub component_version: String,
}

#[derive(Debug)]
struct HandleState {
    status: LifecycleStatus,
    last_launch: Option<DateTime<Utc>>,
    last_kill: Option<DateTime<Utc>>,
    failure: Option<String>,
    graceful_kill: bool,
}

const LAUNCHABLE: &[LifecycleStatus] = &[
    LifecycleStatus::Created,
    LifecycleStatus::Unbound,
    LifecycleStatus::UnboundByPolicy,
    LifecycleStatus::FailedToLaunch,
];

pub struct LifecycleHandle {
    config: Arc<LaunchConfiguration>,
    audit: Arc<dyn AuditSink>,
    state: Mutex<HandleState>,
}

impl fmt::Debug for LifecycleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHandle")
            .field("instance_id", &self.config.instance_id.to_string())
            .field("status", &self.status())
            .finish()
    }
}

impl LifecycleHandle {
    pub fn new(config: Arc<LaunchConfiguration>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            config,
            audit,
            state: Mutex::new(HandleState {
                status: LifecycleStatus::Created,
                last_launch: None,
                last_kill: None,
                failure: None,
                graceful_kill: true,
            }),
        }
    }

    pub fn instance_id(&self) -> &ServiceInstanceId {
        &self.config.instance_id
    }

    pub fn config(&self) -> &Arc<LaunchConfiguration> {
        &self.config
    }

    pub fn status(&self) -> LifecycleStatus {
        self.state.lock().status
    }

    /// Whether the next stop asks the component to exit on its own
    pub fn set_graceful_kill(&self, graceful: bool) {
        self.state.lock().graceful_kill = graceful;
    }

    pub fn graceful_kill(&self) -> bool {
        self.state.lock().graceful_kill
    }

    pub fn begin_launch(&self) -> Result<()> {
        self.transition(
            LAUNCHABLE,
            LifecycleStatus::Bounding,
            AuditCategory::Info,
            "launch started".to_string(),
            |state, now| state.last_launch = Some(now),
        )
    }

    /// Relaunch of a running instance, driven from outside
    pub fn restart(&self) -> Result<()> {
        self.transition(
            &[LifecycleStatus::Bound],
            LifecycleStatus::Bounding,
            AuditCategory::Info,
            "restart requested".to_string(),
            |state, now| state.last_launch = Some(now),
        )
    }

    pub fn confirm_launch(&self) -> Result<()> {
        self.transition(
            &[LifecycleStatus::Bounding],
            LifecycleStatus::Bound,
            AuditCategory::Info,
            "launch confirmed".to_string(),
            |state, _| state.failure = None,
        )
    }

    /// Audit text follows the graceful flag as it stands under the transition lock
    pub fn mark_stopped(&self) -> Result<()> {
        self.transition_with(
            &[
                LifecycleStatus::Bounding,
                LifecycleStatus::Bound,
                LifecycleStatus::FailedToKill,
            ],
            LifecycleStatus::Unbound,
            AuditCategory::Info,
            |state| {
                if state.graceful_kill {
                    "stopped".to_string()
                } else {
                    "killed".to_string()
                }
            },
            |state, now| state.last_kill = Some(now),
        )
    }

    /// Stop forced by server policy, such as a duplicate instance
    pub fn mark_stopped_by_policy(&self, reason: &str, category: AuditCategory) -> Result<()> {
        self.transition(
            &[LifecycleStatus::Bounding, LifecycleStatus::Bound],
            LifecycleStatus::UnboundByPolicy,
            category,
            format!("stopped by policy: {}", reason),
            |state, now| state.last_kill = Some(now),
        )
    }

    pub fn launch_failed(&self, reason: &str) -> Result<()> {
        let failure = reason.to_string();
        self.transition(
            &[LifecycleStatus::Bounding],
            LifecycleStatus::FailedToLaunch,
            AuditCategory::Error,
            format!("launch failed: {}", reason),
            move |state, _| state.failure = Some(failure),
        )
    }

    pub fn kill_failed(&self, reason: &str) -> Result<()> {
        let failure = reason.to_string();
        self.transition(
            &[LifecycleStatus::Bound, LifecycleStatus::Bounding],
            LifecycleStatus::FailedToKill,
            AuditCategory::Error,
            format!("kill failed: {}", reason),
            move |state, _| state.failure = Some(failure),
        )
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let state = self.state.lock();
        LifecycleSnapshot {
            instance_id: self.config.instance_id.to_string(),
            application_id: self.config.instance_id.application_id.clone(),
            status: state.status,
            last_launch: state.last_launch,
            last_kill: state.last_kill,
            failure: state.failure.clone(),
            graceful_kill: state.graceful_kill,
            component_version: self.config.component_version.clone(),
        }
    }

    fn transition(
        &self,
        from: &[LifecycleStatus],
        to: LifecycleStatus,
        category: AuditCategory,
        description: String,
        apply: impl FnOnce(&mut HandleState, DateTime<Utc>),
    ) -> Result<()> {
        self.transition_with(from, to, category, move |_| description, apply)
    }

    fn transition_with(
        &self,
        from: &[LifecycleStatus],
        to: LifecycleStatus,
        category: AuditCategory,
        describe: impl FnOnce(&HandleState) -> String,
        apply: impl FnOnce(&mut HandleState, DateTime<Utc>),
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !from.contains(&state.status) {
            return Err(Error::lifecycle(
                self.config.instance_id.to_string(),
                LifecycleOperation::Transition,
                format!("Cannot move from {} to {}", state.status, to),
            )
            .metadata("from", serde_json::json!(state.status))
            .metadata("to", serde_json::json!(to)));
        }

        let description = describe(&state);
        let now = Time::now();
        apply(&mut state, now);
        state.status = to;

        tracing::debug!("{} -> {}", self.config.instance_id, to);
        self.audit.raise_event(AuditEvent {
            status: to,
            category,
            description,
            instance_id: self.config.instance_id.instance_name.clone(),
            application_id: self.config.instance_id.application_id.clone(),
            timestamp: now,
        });
        Ok(())
    }
}
