// src/lifecycle/launcher.rs

//! Launch mechanisms and the CCP channel shared by all of them.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::task::JoinHandle;

use crate::ccp::{
    BasicComponent, CcpManager, Command, CommandKind, ComponentEndpoint, ComponentState,
    ControlEvent, ControlHandler, Data, DataRequest, DataType, Dispatch, EventBody, LogLevel,
    LogLevelRequest, Status,
};
use crate::config::CcpConfig;
use crate::error::{Error, LifecycleOperation, Result, ResultExt};
use crate::lifecycle::handle::LaunchConfiguration;
use crate::transport::Transport;
use crate::utils::async_utils::with_timeout;

/// Environment variable carrying the instance id to a launched process
pub const INSTANCE_ID_ENV: &str = "CCP_INSTANCE_ID";

/// Request/reply conversation with one component instance
#[derive(Debug, Clone)]
pub struct ComponentChannel {
    ccp: Arc<CcpManager>,
    target: String,
    timeout: Duration,
}

impl ComponentChannel {
    pub fn new(ccp: Arc<CcpManager>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ccp,
            target: target.into(),
            timeout,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::lifecycle(self.target.clone(), LifecycleOperation::Request, message)
    }

    async fn request_one(&self, event: ControlEvent) -> Result<Dispatch> {
        self.ccp
            .request(event, &[self.target.as_str()], self.timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| self.error("No reply received"))
    }

    /// Sends `command` and returns the component's status reply
    pub async fn command(&self, command: Command) -> Result<Status> {
        let kind = command.kind.clone();
        let reply = self.request_one(self.ccp.new_event(command)).await?;
        match reply.event.body {
            EventBody::Status(status) if status.state == ComponentState::Error => Err(self.error(
                format!("{} rejected: {}", kind.as_str(), status.message),
            )),
            EventBody::Status(status) => Ok(status),
            other => Err(self.error(format!(
                "Expected STATUS reply to {}, got {}",
                kind.as_str(),
                other.event_type()
            ))),
        }
    }

    /// Publishes `command` without waiting for an answer
    pub async fn notify(&self, command: Command) -> Result<()> {
        let event = self.ccp.new_event(command);
        self.ccp.send(&event, &[self.target.as_str()]).await
    }

    pub async fn set_log_level(&self, levels: &BTreeMap<String, LogLevel>) -> Result<()> {
        self.command(Command::set_log_level(levels)).await.map(|_| ())
    }

    /// Current levels of `loggers`, or of every logger when empty
    pub async fn get_log_levels(&self, loggers: &[String]) -> Result<BTreeMap<String, LogLevel>> {
        let request = LogLevelRequest::new(loggers.iter().cloned());
        match self.request_data(self.ccp.new_event(request)).await? {
            Some(Data::LogLevels(levels)) => Ok(levels),
            _ => Err(self.error("Reply carried no log levels")),
        }
    }

    pub async fn get_component_stats(&self) -> Result<String> {
        let request = DataRequest::new([DataType::ComponentStats]);
        match self.request_data(self.ccp.new_event(request)).await? {
            Some(Data::ComponentStats(stats)) => Ok(stats),
            _ => Err(self.error("Reply carried no component stats")),
        }
    }

    /// First payload of a DATA reply, matched on the requested type
    async fn request_data(&self, event: ControlEvent) -> Result<Option<Data>> {
        let wanted = match &event.body {
            EventBody::LogLevelRequest(_) => DataType::LogLevels,
            EventBody::DataRequest(request) => request
                .data_types
                .iter()
                .next()
                .copied()
                .ok_or_else(|| self.error("Empty data request"))?,
            other => return Err(self.error(format!("{} is not a data request", other.event_type()))),
        };
        let reply = self.request_one(event).await?;
        match reply.event.body {
            EventBody::Data(data) => Ok(data.get(wanted).cloned()),
            other => Err(self.error(format!("Expected DATA reply, got {}", other.event_type()))),
        }
    }

    /// Asks the component to stop and waits for its STOPPED status
    pub async fn stop(&self) -> Result<()> {
        let status = self.command(Command::new(CommandKind::Stop)).await?;
        if status.state != ComponentState::Stopped {
            return Err(self.error(format!("Component reported {} after STOP", status.state)));
        }
        Ok(())
    }
}

/// External container engine, injected by the embedding application
#[async_trait]
pub trait ContainerRuntime: Send + Sync + fmt::Debug {
    /// Starts a container for `config` and returns its id
    async fn start(&self, config: &LaunchConfiguration) -> Result<String>;

    async fn is_running(&self, container_id: &str) -> Result<bool>;

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;

    async fn kill(&self, container_id: &str) -> Result<()>;
}

/// Child process running the component executable
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    child: tokio::sync::Mutex<Option<Child>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    async fn launch(&self, config: &LaunchConfiguration) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        let instance = config.instance_id.to_string();

        let mut command = ProcessCommand::new(&config.executable);
        command
            .args(&config.arguments)
            .envs(&config.environment)
            .env(INSTANCE_ID_ENV, &instance)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            Error::lifecycle(
                instance.clone(),
                LifecycleOperation::Launch,
                format!("Failed to spawn {}: {}", config.executable.display(), e),
            )
        })?;
        tracing::info!("Spawned '{}' as pid {:?}", instance, child.id());
        *child_slot = Some(child);
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        let mut child_slot = self.child.lock().await;
        match child_slot.as_mut() {
            Some(child) => Ok(child
                .try_wait()
                .with_context(|| "Failed to poll child process".to_string())?
                .is_none()),
            None => Ok(false),
        }
    }

    async fn wait_for_exit(&self, grace: Duration) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            let status = with_timeout(child.wait(), grace)
                .await?
                .with_context(|| "Failed to wait for child process".to_string())?;
            tracing::debug!("Child exited with {}", status);
        }
        *child_slot = None;
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            child
                .kill()
                .await
                .with_context(|| "Failed to kill child process".to_string())?;
        }
        *child_slot = None;
        Ok(())
    }
}

/// Component hosted on a task inside this process
#[derive(Debug)]
pub struct InProcessLauncher {
    config: CcpConfig,
    transport: Arc<dyn Transport>,
    running: Arc<AtomicBool>,
    component: Mutex<Option<Arc<BasicComponent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessLauncher {
    pub fn new(config: CcpConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            running: Arc::new(AtomicBool::new(false)),
            component: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// The hosted component, while one is running
    pub fn component(&self) -> Option<Arc<BasicComponent>> {
        self.component.lock().clone()
    }

    async fn launch(&self, launch: &LaunchConfiguration) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::lifecycle(
                launch.instance_id.to_string(),
                LifecycleOperation::Launch,
                "Component is already running",
            ));
        }

        let process_id = format!("{}:{}", std::process::id(), launch.instance_id.instance_name);
        let component = Arc::new(BasicComponent::new(
            launch.component_version.clone(),
            process_id,
        ));
        let endpoint = ComponentEndpoint::connect(
            &self.config,
            Arc::clone(&self.transport),
            launch.instance_id.clone(),
            Arc::clone(&component) as Arc<dyn ControlHandler>,
        )
        .await?;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let hosted = Arc::clone(&component);
        let task = tokio::spawn(async move {
            let mut stopped = hosted.stopped();
            if let Err(e) = hosted.announce(&endpoint).await {
                tracing::error!("'{}' failed to announce: {}", endpoint.instance_id(), e);
            }
            while !*stopped.borrow_and_update() {
                if stopped.changed().await.is_err() {
                    break;
                }
            }
            endpoint.close();
            running.store(false, Ordering::SeqCst);
        });

        *self.component.lock() = Some(component);
        *self.task.lock() = Some(task);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn wait_for_exit(&self, grace: Duration) -> Result<()> {
        let task = self.task.lock().take();
        if let Some(task) = task {
            with_timeout(task, grace)
                .await?
                .with_context(|| "In-process component task failed".to_string())?;
        }
        self.component.lock().take();
        Ok(())
    }

    fn kill(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.component.lock().take();
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Component running in a container managed by a [`ContainerRuntime`]
#[derive(Debug)]
pub struct ContainerLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: Mutex<Option<String>>,
}

impl ContainerLauncher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            container_id: Mutex::new(None),
        }
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id.lock().clone()
    }

    async fn launch(&self, config: &LaunchConfiguration) -> Result<()> {
        if config.image.is_none() {
            return Err(Error::lifecycle(
                config.instance_id.to_string(),
                LifecycleOperation::Launch,
                "Container launch needs an image",
            ));
        }
        let id = self.runtime.start(config).await?;
        tracing::info!("Started container {} for '{}'", id, config.instance_id);
        *self.container_id.lock() = Some(id);
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        match self.container_id() {
            Some(id) => self.runtime.is_running(&id).await,
            None => Ok(false),
        }
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        if let Some(id) = self.container_id() {
            self.runtime.stop(&id, grace).await?;
            self.container_id.lock().take();
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        if let Some(id) = self.container_id() {
            self.runtime.kill(&id).await?;
            self.container_id.lock().take();
        }
        Ok(())
    }
}

/// How an instance is hosted; chosen once when its controller is built
#[derive(Debug)]
pub enum LaunchMechanism {
    SeparateProcess(ProcessLauncher),
    InProcess(InProcessLauncher),
    Container(ContainerLauncher),
}

impl LaunchMechanism {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SeparateProcess(_) => "separate_process",
            Self::InProcess(_) => "in_process",
            Self::Container(_) => "container",
        }
    }

    pub async fn launch(&self, config: &LaunchConfiguration) -> Result<()> {
        match self {
            Self::SeparateProcess(launcher) => launcher.launch(config).await,
            Self::InProcess(launcher) => launcher.launch(config).await,
            Self::Container(launcher) => launcher.launch(config).await,
        }
    }

    pub async fn is_running(&self) -> Result<bool> {
        match self {
            Self::SeparateProcess(launcher) => launcher.is_running().await,
            Self::InProcess(launcher) => Ok(launcher.is_running()),
            Self::Container(launcher) => launcher.is_running().await,
        }
    }

    /// Graceful stop: a CCP `STOP`, then up to `grace` for the instance to go away
    pub async fn stop(&self, channel: &ComponentChannel, grace: Duration) -> Result<()> {
        match self {
            Self::SeparateProcess(launcher) => {
                channel.stop().await?;
                launcher.wait_for_exit(grace).await
            }
            Self::InProcess(launcher) => {
                channel.stop().await?;
                launcher.wait_for_exit(grace).await
            }
            Self::Container(launcher) => {
                if let Err(e) = channel.stop().await {
                    tracing::debug!("STOP to '{}' unanswered: {}", channel.target(), e);
                }
                launcher.stop(grace).await
            }
        }
    }

    pub async fn kill(&self) -> Result<()> {
        match self {
            Self::SeparateProcess(launcher) => launcher.kill().await,
            Self::InProcess(launcher) => {
                launcher.kill();
                Ok(())
            }
            Self::Container(launcher) => launcher.kill().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use crate::types::ServiceInstanceId;

    async fn setup() -> (Arc<CcpManager>, Arc<dyn Transport>, CcpConfig) {
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
        let config = CcpConfig::default();
        let ccp = Arc::new(CcpManager::new(config.clone(), Arc::clone(&transport)));
        ccp.start().await.unwrap();
        (ccp, transport, config)
    }

    #[derive(Debug, Default)]
    struct FakeRuntime {
        running: AtomicBool,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn start(&self, config: &LaunchConfiguration) -> Result<String> {
            self.running.store(true, Ordering::SeqCst);
            Ok(format!("ctr-{}", config.instance_id.instance_name))
        }

        async fn is_running(&self, _container_id: &str) -> Result<bool> {
            Ok(self.running.load(Ordering::SeqCst))
        }

        async fn stop(&self, _container_id: &str, _grace: Duration) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn kill(&self, _container_id: &str) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_in_process_channel_capabilities() {
        let (ccp, transport, config) = setup().await;
        let launch = LaunchConfiguration::new(ServiceInstanceId::new("App1", "comp1"));
        let mechanism = LaunchMechanism::InProcess(InProcessLauncher::new(config, transport));
        mechanism.launch(&launch).await.unwrap();
        assert!(mechanism.is_running().await.unwrap());

        let channel = ComponentChannel::new(ccp, "App1__comp1", Duration::from_secs(2));
        let mut levels = BTreeMap::new();
        levels.insert("bus.core".to_string(), LogLevel::Warn);
        channel.set_log_level(&levels).await.unwrap();

        let read = channel
            .get_log_levels(&["bus.core".to_string()])
            .await
            .unwrap();
        assert_eq!(read, levels);
        assert!(channel.get_component_stats().await.unwrap().starts_with("handled="));

        mechanism.stop(&channel, Duration::from_secs(2)).await.unwrap();
        assert!(!mechanism.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_log_level_is_an_error() {
        let (ccp, transport, config) = setup().await;
        let launch = LaunchConfiguration::new(ServiceInstanceId::new("App1", "comp1"));
        let launcher = InProcessLauncher::new(config, transport);
        launcher.launch(&launch).await.unwrap();

        let channel = ComponentChannel::new(ccp, "App1__comp1", Duration::from_secs(2));
        let command = Command::new(CommandKind::SetLogLevel).arg("bus.core", "LOUD");
        assert!(channel.command(command).await.is_err());
        launcher.kill();
        assert!(!launcher.is_running());
    }

    #[tokio::test]
    async fn test_in_process_double_launch_rejected() {
        let (_ccp, transport, config) = setup().await;
        let launch = LaunchConfiguration::new(ServiceInstanceId::new("App1", "comp1"));
        let launcher = InProcessLauncher::new(config, transport);
        launcher.launch(&launch).await.unwrap();
        assert!(launcher.launch(&launch).await.is_err());
        launcher.kill();
    }

    #[tokio::test]
    async fn test_container_needs_image() {
        let runtime = Arc::new(FakeRuntime::default());
        let mechanism = LaunchMechanism::Container(ContainerLauncher::new(runtime));
        let launch = LaunchConfiguration::new(ServiceInstanceId::new("App1", "comp1"));
        assert!(mechanism.launch(&launch).await.is_err());

        let launch = launch.with_image("registry.local/comp:1");
        mechanism.launch(&launch).await.unwrap();
        assert!(mechanism.is_running().await.unwrap());
        mechanism.kill().await.unwrap();
        assert!(!mechanism.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_executable_fails_launch() {
        let launch = LaunchConfiguration::new(ServiceInstanceId::new("App1", "comp1"))
            .with_executable("/nonexistent/esb-component");
        let mechanism = LaunchMechanism::SeparateProcess(ProcessLauncher::new());
        assert!(mechanism.launch(&launch).await.is_err());
        assert!(!mechanism.is_running().await.unwrap());
    }
}
