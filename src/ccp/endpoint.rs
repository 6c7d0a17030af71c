// src/ccp/endpoint.rs

//! Component-instance side of the protocol.
//!
//! A [`ComponentEndpoint`] listens on the outbound destination for events that
//! name its own instance id and publishes its replies and reports to the
//! inbound destination. Events are handed to a [`ControlHandler`] one at a
//! time, in arrival order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ccp::data::{Data, DataType, LogLevel, MemoryUsage};
use crate::ccp::event::{
    Command, CommandKind, ComponentState, ControlEvent, DataEvent, DataRequest, EventBody,
    Handshake, LogLevelRequest, Status,
};
use crate::ccp::{registry, EVENT_TYPE_HEADER, SOURCE_OBJECT, TARGET_OBJECTS};
use crate::config::CcpConfig;
use crate::error::Result;
use crate::transport::{
    DestinationKind, MessageFilter, MessageHandler, Publisher, Subscription, Transport,
    TransportMessage,
};
use crate::types::ServiceInstanceId;

/// Reacts to control events addressed to one component instance
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn on_control(&self, endpoint: &ComponentEndpoint, event: ControlEvent) -> Result<()>;
}

struct EndpointInner {
    instance_id: ServiceInstanceId,
    source: String,
    control_plane_id: String,
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publisher>,
    subscription: Mutex<Option<Subscription>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.close();
        }
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

/// Cheap to clone; all clones share one subscription
#[derive(Clone)]
pub struct ComponentEndpoint {
    inner: Arc<EndpointInner>,
}

impl fmt::Debug for ComponentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentEndpoint")
            .field("instance_id", &self.inner.source)
            .finish()
    }
}

impl ComponentEndpoint {
    /// Subscribes `instance_id` to its control traffic
    pub async fn connect(
        config: &CcpConfig,
        transport: Arc<dyn Transport>,
        instance_id: ServiceInstanceId,
        handler: Arc<dyn ControlHandler>,
    ) -> Result<Self> {
        let outbound = transport
            .enable_destination(&config.outbound_destination, DestinationKind::Topic)
            .await?;
        let inbound = transport
            .enable_destination(&config.inbound_destination, DestinationKind::Topic)
            .await?;
        let publisher = transport.create_publisher(&inbound).await?;
        let source = instance_id.to_string();

        let inner = Arc::new(EndpointInner {
            instance_id,
            source: source.clone(),
            control_plane_id: config.control_plane_id.clone(),
            transport: Arc::clone(&transport),
            publisher,
            subscription: Mutex::new(None),
            worker: Mutex::new(None),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<ControlEvent>();
        let decoder_source = source.clone();
        let decoder: Arc<dyn MessageHandler> = Arc::new(move |message: TransportMessage| {
            let Some(tag) = message.header(EVENT_TYPE_HEADER) else {
                tracing::warn!("'{}' dropping message without event type", decoder_source);
                return;
            };
            match registry::decode_event(tag, message.body.clone()) {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => {
                    tracing::warn!("'{}' dropping {}: {}", decoder_source, tag, e.message);
                }
            }
        });

        let weak: Weak<EndpointInner> = Arc::downgrade(&inner);
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let endpoint = ComponentEndpoint { inner };
                let event_type = event.event_type();
                if let Err(e) = handler.on_control(&endpoint, event).await {
                    tracing::error!(
                        "'{}' failed to handle {}: {}",
                        endpoint.inner.source,
                        event_type,
                        e
                    );
                }
            }
        });

        let subscription = transport
            .subscribe(&outbound, MessageFilter::Target(source.clone()), decoder)
            .await?;
        *inner.subscription.lock() = Some(subscription);
        *inner.worker.lock() = Some(worker);

        tracing::debug!("Component endpoint '{}' connected", source);
        Ok(Self { inner })
    }

    pub fn instance_id(&self) -> &ServiceInstanceId {
        &self.inner.instance_id
    }

    /// Publishes `event` to the control plane, stamped with this instance as source
    pub async fn publish(&self, event: &ControlEvent) -> Result<()> {
        let mut message = self.inner.transport.create_message();
        message.set_header(EVENT_TYPE_HEADER, event.event_type().as_str());
        message.set_header(SOURCE_OBJECT, self.inner.source.as_str());
        message.set_header(TARGET_OBJECTS, self.inner.control_plane_id.as_str());
        message.priority = event.header.priority;
        message.expiry = event.header.expiry;
        message.body = event.encode();
        self.inner.publisher.publish(message).await
    }

    /// Answers `request` with a correlated reply
    pub async fn reply(&self, request: &ControlEvent, body: impl Into<EventBody>) -> Result<()> {
        self.publish(&ControlEvent::reply_to(request, body)).await
    }

    /// Announces this instance; returns the handshake's event id
    pub async fn handshake(&self, component_version: &str, process_id: &str) -> Result<u64> {
        let handshake = ControlEvent::new(Handshake {
            component_version: component_version.to_string(),
            process_id: process_id.to_string(),
        });
        self.publish(&handshake).await?;
        Ok(handshake.event_id())
    }

    pub async fn report_status(&self, state: ComponentState, message: &str) -> Result<()> {
        self.publish(&ControlEvent::new(Status::new(state, message)))
            .await
    }

    /// Stops receiving. Events already queued are discarded.
    pub fn close(&self) {
        if let Some(subscription) = self.inner.subscription.lock().take() {
            subscription.close();
        }
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.abort();
        }
    }
}

/// Handler that answers the standard requests a managed component supports
pub struct BasicComponent {
    component_version: String,
    process_id: String,
    log_levels: Mutex<BTreeMap<String, LogLevel>>,
    handled: AtomicU64,
    announced: AtomicU64,
    stop_tx: watch::Sender<bool>,
}

impl fmt::Debug for BasicComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicComponent")
            .field("process_id", &self.process_id)
            .field("handled", &self.handled.load(Ordering::Relaxed))
            .finish()
    }
}

impl BasicComponent {
    pub fn new(component_version: impl Into<String>, process_id: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let mut levels = BTreeMap::new();
        levels.insert("root".to_string(), LogLevel::Info);
        Self {
            component_version: component_version.into(),
            process_id: process_id.into(),
            log_levels: Mutex::new(levels),
            handled: AtomicU64::new(0),
            announced: AtomicU64::new(0),
            stop_tx,
        }
    }

    pub fn component_version(&self) -> &str {
        &self.component_version
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn log_levels(&self) -> BTreeMap<String, LogLevel> {
        self.log_levels.lock().clone()
    }

    /// Flips to `true` once the component has been told to stop
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Sends the handshake and remembers it so only its own ack can reject it
    pub async fn announce(&self, endpoint: &ComponentEndpoint) -> Result<()> {
        let handshake = ControlEvent::new(Handshake {
            component_version: self.component_version.clone(),
            process_id: self.process_id.clone(),
        });
        self.announced.store(handshake.event_id(), Ordering::SeqCst);
        endpoint.publish(&handshake).await
    }

    fn stats(&self) -> String {
        format!("handled={}", self.handled.load(Ordering::Relaxed))
    }

    fn collect(&self, request: &DataRequest) -> DataEvent {
        request
            .data_types
            .iter()
            .fold(DataEvent::default(), |reply, data_type| {
                reply.with(match data_type {
                    DataType::MemoryUsage => Data::MemoryUsage(MemoryUsage::default()),
                    DataType::LogLevels => Data::LogLevels(self.log_levels()),
                    DataType::ProcessId => Data::ProcessId(self.process_id.clone()),
                    DataType::ComponentStats => Data::ComponentStats(self.stats()),
                    DataType::MicroserviceConfiguration => {
                        Data::MicroserviceConfiguration(String::new())
                    }
                    DataType::NamedConfiguration => Data::NamedConfiguration(BTreeMap::new()),
                    DataType::ManageableProperties => Data::ManageableProperties(BTreeMap::new()),
                    DataType::PortConfiguration => Data::PortConfiguration(Vec::new()),
                })
            })
    }

    fn levels_for(&self, request: &LogLevelRequest) -> BTreeMap<String, LogLevel> {
        let levels = self.log_levels.lock();
        if request.logger_names.is_empty() {
            return levels.clone();
        }
        request
            .logger_names
            .iter()
            .filter_map(|name| levels.get(name).map(|level| (name.clone(), *level)))
            .collect()
    }

    fn apply_log_levels(&self, command: &Command) -> std::result::Result<usize, String> {
        let mut parsed = Vec::with_capacity(command.arguments.len());
        for (logger, level) in &command.arguments {
            let level = LogLevel::from_wire(level)
                .ok_or_else(|| format!("unknown log level '{}' for '{}'", level, logger))?;
            parsed.push((logger.clone(), level));
        }
        let count = parsed.len();
        self.log_levels.lock().extend(parsed);
        Ok(count)
    }

    async fn run_command(
        &self,
        endpoint: &ComponentEndpoint,
        event: &ControlEvent,
        command: &Command,
    ) -> Result<()> {
        let status = match &command.kind {
            CommandKind::Stop => {
                // The reply goes out before the stop signal tears the endpoint down.
                let replied = if event.reply_needed() {
                    let status = Status::new(ComponentState::Stopped, "stopped on request");
                    endpoint.reply(event, status).await
                } else {
                    Ok(())
                };
                self.stop_tx.send_replace(true);
                return replied;
            }
            CommandKind::Kill => {
                self.stop_tx.send_replace(true);
                return Ok(());
            }
            CommandKind::SetLogLevel => match self.apply_log_levels(command) {
                Ok(count) => Status::new(
                    ComponentState::Running,
                    format!("{} log levels updated", count),
                ),
                Err(reason) => Status::new(ComponentState::Error, reason),
            },
            CommandKind::Restart => Status::new(ComponentState::Running, "restart not supported"),
            CommandKind::Custom(name) => {
                Status::new(ComponentState::Error, format!("unknown command '{}'", name))
            }
        };
        if event.reply_needed() {
            endpoint.reply(event, status).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ControlHandler for BasicComponent {
    async fn on_control(&self, endpoint: &ComponentEndpoint, event: ControlEvent) -> Result<()> {
        self.handled.fetch_add(1, Ordering::Relaxed);
        match &event.body {
            EventBody::DataRequest(request) => {
                let reply = self.collect(request);
                match request.periodic {
                    Some(periodic) if periodic.count > 1 => {
                        endpoint.reply(&event, reply).await?;
                        // Repeats end once the endpoint is gone or the component stops.
                        let weak = Arc::downgrade(&endpoint.inner);
                        let mut stopped = self.stopped();
                        let request_event = event.clone();
                        let repeats = self.collect(request);
                        tokio::spawn(async move {
                            for _ in 1..periodic.count {
                                if *stopped.borrow_and_update() {
                                    break;
                                }
                                tokio::select! {
                                    _ = tokio::time::sleep(Duration::from_millis(periodic.interval_ms)) => {}
                                    _ = stopped.changed() => break,
                                }
                                let Some(inner) = weak.upgrade() else { break };
                                let endpoint = ComponentEndpoint { inner };
                                if endpoint.reply(&request_event, repeats.clone()).await.is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    _ => endpoint.reply(&event, reply).await?,
                }
            }
            EventBody::LogLevelRequest(request) => {
                let levels = self.levels_for(request);
                endpoint
                    .reply(&event, DataEvent::default().with(Data::LogLevels(levels)))
                    .await?;
            }
            EventBody::Command(command) => self.run_command(endpoint, &event, command).await?,
            EventBody::HandshakeAck(ack)
                if !ack.accepted
                    && event.correlation_id() == self.announced.load(Ordering::SeqCst) =>
            {
                tracing::warn!(
                    "'{}' handshake rejected: {}",
                    endpoint.instance_id(),
                    ack.reason
                );
                self.stop_tx.send_replace(true);
            }
            other => {
                tracing::debug!(
                    "'{}' ignoring {}",
                    endpoint.instance_id(),
                    other.event_type()
                );
            }
        }
        Ok(())
    }
}
