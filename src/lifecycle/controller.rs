// src/lifecycle/controller.rs

//! Drives one instance's launch mechanism and records the outcome on its handle.
//!
//! Launch, stop, kill and restart hold the controller's operation lock for
//! their whole run, so concurrent calls on one instance take turns.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::ccp::{CcpManager, LogLevel};
use crate::config::LifecycleConfig;
use crate::error::Result;
use crate::lifecycle::handle::{LaunchConfiguration, LifecycleHandle, LifecycleSnapshot};
use crate::lifecycle::launcher::{ComponentChannel, LaunchMechanism};
use crate::lifecycle::status::{AuditCategory, AuditSink, LifecycleStatus};
use crate::types::ServiceInstanceId;

#[derive(Debug)]
pub struct ComponentController {
    handle: LifecycleHandle,
    mechanism: LaunchMechanism,
    channel: ComponentChannel,
    kill_grace: Duration,
    operation: tokio::sync::Mutex<()>,
}

impl ComponentController {
    pub fn new(
        launch: LaunchConfiguration,
        mechanism: LaunchMechanism,
        ccp: Arc<CcpManager>,
        audit: Arc<dyn AuditSink>,
        config: &LifecycleConfig,
    ) -> Self {
        let launch = Arc::new(launch);
        let channel = ComponentChannel::new(
            ccp,
            launch.instance_id.to_string(),
            Duration::from_millis(config.request_timeout_ms),
        );
        Self {
            handle: LifecycleHandle::new(launch, audit),
            mechanism,
            channel,
            kill_grace: Duration::from_millis(config.kill_grace_period_ms),
            operation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn instance_id(&self) -> &ServiceInstanceId {
        self.handle.instance_id()
    }

    pub fn handle(&self) -> &LifecycleHandle {
        &self.handle
    }

    pub fn mechanism(&self) -> &LaunchMechanism {
        &self.mechanism
    }

    pub fn channel(&self) -> &ComponentChannel {
        &self.channel
    }

    pub fn status(&self) -> LifecycleStatus {
        self.handle.status()
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.handle.snapshot()
    }

    /// Starts the instance; it becomes BOUND once its handshake arrives
    pub async fn launch(&self) -> Result<()> {
        let _operation = self.operation.lock().await;
        self.handle.begin_launch()?;
        self.start_mechanism().await
    }

    /// Graceful stop, falling back to a kill when the instance does not comply.
    ///
    /// Does nothing when the instance is not running.
    pub async fn stop(&self) -> Result<()> {
        let _operation = self.operation.lock().await;
        if !self.needs_stop() {
            tracing::debug!("'{}' is {}, nothing to stop", self.instance_id(), self.status());
            return Ok(());
        }
        self.handle.set_graceful_kill(true);
        match self.mechanism.stop(&self.channel, self.kill_grace).await {
            Ok(()) => self.record_stopped(),
            Err(e) => {
                tracing::warn!(
                    "Graceful stop of '{}' failed, killing: {}",
                    self.instance_id(),
                    e
                );
                self.kill_locked().await
            }
        }
    }

    /// Does nothing when the instance is not running
    pub async fn kill(&self) -> Result<()> {
        let _operation = self.operation.lock().await;
        if !self.needs_stop() {
            tracing::debug!("'{}' is {}, nothing to kill", self.instance_id(), self.status());
            return Ok(());
        }
        self.kill_locked().await
    }

    /// Stop forced by server policy; the audit event carries `reason`
    pub async fn stop_by_policy(&self, reason: &str, category: AuditCategory) -> Result<()> {
        let _operation = self.operation.lock().await;
        if !self.status().is_active() {
            tracing::debug!("'{}' is {}, policy stop skipped", self.instance_id(), self.status());
            return Ok(());
        }
        self.handle.set_graceful_kill(false);
        if let Err(e) = self.mechanism.kill().await {
            self.handle.kill_failed(&e.message)?;
            return Err(e);
        }
        self.handle.mark_stopped_by_policy(reason, category)
    }

    /// Relaunches a BOUND instance
    pub async fn restart(&self) -> Result<()> {
        let _operation = self.operation.lock().await;
        self.handle.restart()?;
        if let Err(e) = self.mechanism.kill().await {
            self.handle.kill_failed(&e.message)?;
            return Err(e);
        }
        self.start_mechanism().await
    }

    pub async fn is_running(&self) -> Result<bool> {
        self.mechanism.is_running().await
    }

    pub async fn set_log_level(&self, levels: &BTreeMap<String, LogLevel>) -> Result<()> {
        self.channel.set_log_level(levels).await
    }

    pub async fn get_log_levels(&self, loggers: &[String]) -> Result<BTreeMap<String, LogLevel>> {
        self.channel.get_log_levels(loggers).await
    }

    pub async fn get_component_stats(&self) -> Result<String> {
        self.channel.get_component_stats().await
    }

    fn needs_stop(&self) -> bool {
        let status = self.handle.status();
        status.is_active() || status == LifecycleStatus::FailedToKill
    }

    /// Caller holds the operation lock
    async fn kill_locked(&self) -> Result<()> {
        self.handle.set_graceful_kill(false);
        match self.mechanism.kill().await {
            Ok(()) => self.record_stopped(),
            Err(e) => {
                self.handle.kill_failed(&e.message)?;
                Err(e)
            }
        }
    }

    /// An unsolicited STOPPED report may already have moved the handle to UNBOUND
    fn record_stopped(&self) -> Result<()> {
        if self.needs_stop() {
            self.handle.mark_stopped()
        } else {
            Ok(())
        }
    }

    async fn start_mechanism(&self) -> Result<()> {
        if let Err(e) = self.mechanism.launch(self.handle.config()).await {
            self.handle.launch_failed(&e.message)?;
            return Err(e);
        }
        Ok(())
    }
}
