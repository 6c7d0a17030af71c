// src/ccp/manager.rs

//! Control-plane side of the protocol.
//!
//! [`CcpManager`] publishes control events to component instances on the
//! outbound destination and consumes their events from the inbound one. Every
//! decoded inbound event is offered to the correlation tracker and, separately,
//! to the listeners subscribed to its type.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ccp::correlation::{CorrelationTracker, ReplyCallback};
use crate::ccp::event::{ControlEvent, EventBody, EventType};
use crate::ccp::listener::{EventListener, ListenerRegistry};
use crate::ccp::{registry, Dispatch, EVENT_TYPE_HEADER, SOURCE_OBJECT, TARGET_OBJECTS, TARGET_SEPARATOR};
use crate::config::CcpConfig;
use crate::error::{Error, ManagerOperation, Result, ResultExt};
use crate::manager::{HealthStatus, ManagedState, Manager, ManagerState, ManagerStatus};
use crate::transport::{
    DestinationKind, MessageFilter, MessageHandler, Publisher, Subscription, Transport,
    TransportMessage,
};
use crate::utils::async_utils::with_timeout;

/// Traffic counters reported through the manager status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcpStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub replies_matched: u64,
    pub pending_requests: usize,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    replies_matched: AtomicU64,
}

/// State shared with the inbound delivery task
#[derive(Debug, Default)]
struct DispatchCore {
    tracker: CorrelationTracker,
    listeners: ListenerRegistry,
    counters: Counters,
}

impl DispatchCore {
    fn handle_inbound(&self, message: TransportMessage) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(tag) = message.header(EVENT_TYPE_HEADER) else {
            tracing::warn!("Dropping inbound message without {}", EVENT_TYPE_HEADER);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let source = message.header(SOURCE_OBJECT).unwrap_or_default().to_string();

        let event = match registry::decode_event(tag, message.body.clone()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping inbound {} from '{}': {}", tag, source, e.message);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        tracing::debug!(
            "Received {} {} from '{}' (correlation {})",
            event.event_type(),
            event.event_id(),
            source,
            event.correlation_id()
        );
        let dispatch = Dispatch::new(source, event);

        let correlation_id = dispatch.event.correlation_id();
        match panic::catch_unwind(AssertUnwindSafe(|| {
            self.tracker.on_reply(correlation_id, &dispatch)
        })) {
            Ok(true) => {
                self.counters.replies_matched.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(_) => {
                tracing::error!("Reply callback for event {} panicked", correlation_id);
            }
        }

        self.listeners.fan_out(&dispatch);
    }
}

/// Control-plane endpoint of the protocol
pub struct CcpManager {
    state: ManagedState,
    config: CcpConfig,
    transport: Arc<dyn Transport>,
    core: Arc<DispatchCore>,
    publisher: RwLock<Option<Arc<dyn Publisher>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl std::fmt::Debug for CcpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CcpManager")
            .field("state", &self.state)
            .field("outbound", &self.config.outbound_destination)
            .field("inbound", &self.config.inbound_destination)
            .field("started", &self.is_started())
            .finish()
    }
}

impl CcpManager {
    pub fn new(config: CcpConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "ccp_manager"),
            config,
            transport,
            core: Arc::new(DispatchCore::default()),
            publisher: RwLock::new(None),
            subscription: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CcpConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.publisher.read().is_some()
    }

    /// Establishes both destinations and starts consuming inbound traffic.
    ///
    /// Calling it on a started manager does nothing.
    pub async fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        self.state.set_state(ManagerState::Initializing).await;

        match self.connect().await {
            Ok((publisher, subscription)) => {
                *self.publisher.write() = Some(publisher);
                *self.subscription.lock() = Some(subscription);
                self.state.set_state(ManagerState::Running).await;
                self.state.set_health(HealthStatus::Healthy).await;
                tracing::info!(
                    "CCP manager started (outbound '{}', inbound '{}')",
                    self.config.outbound_destination,
                    self.config.inbound_destination
                );
                Ok(())
            }
            Err(e) => {
                self.state.set_state(ManagerState::Error).await;
                self.state.set_health(HealthStatus::Unhealthy).await;
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<(Arc<dyn Publisher>, Subscription)> {
        let outbound = self
            .transport
            .enable_destination(&self.config.outbound_destination, DestinationKind::Topic)
            .await?;
        let inbound = self
            .transport
            .enable_destination(&self.config.inbound_destination, DestinationKind::Topic)
            .await?;
        let publisher = self.transport.create_publisher(&outbound).await?;

        let core = Arc::clone(&self.core);
        let handler: Arc<dyn MessageHandler> =
            Arc::new(move |message: TransportMessage| core.handle_inbound(message));
        let subscription = self
            .transport
            .subscribe(&inbound, MessageFilter::All, handler)
            .await?;
        Ok((publisher, subscription))
    }

    /// Stops consuming and publishing. Pending requests stay registered.
    pub async fn stop(&self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.close();
        }
        self.publisher.write().take();

        let pending = self.core.tracker.pending_count();
        if pending > 0 {
            tracing::warn!("CCP manager stopped with {} pending requests", pending);
        }
        self.state.set_state(ManagerState::Shutdown).await;
        self.state.set_health(HealthStatus::Unknown).await;
        Ok(())
    }

    /// New event stamped with the configured protocol version and priority
    pub fn new_event(&self, body: impl Into<EventBody>) -> ControlEvent {
        let mut event = ControlEvent::new(body).with_priority(self.config.default_priority);
        event.header.version = self.config.protocol_version;
        event
    }

    /// Publishes `event` to `targets` without tracking replies
    pub async fn send<T: AsRef<str>>(&self, event: &ControlEvent, targets: &[T]) -> Result<()> {
        let (publisher, message) = self.prepare(event, targets)?;
        self.publish(&publisher, event, message).await
    }

    /// Publishes `event`, routing each correlated reply to `callback`.
    ///
    /// When the event needs a reply, one is expected from every target and the
    /// registration happens before the publish.
    pub async fn send_with_callback<T: AsRef<str>>(
        &self,
        event: &ControlEvent,
        callback: Arc<dyn ReplyCallback>,
        targets: &[T],
    ) -> Result<()> {
        let (publisher, message) = self.prepare(event, targets)?;
        let event_id = event.event_id();

        if !event.reply_needed() {
            tracing::debug!("Event {} needs no reply, callback ignored", event_id);
            return self.publish(&publisher, event, message).await;
        }

        self.core
            .tracker
            .register(event_id, callback, targets.len())?;
        if let Err(e) = self.publish(&publisher, event, message).await {
            self.core.tracker.cancel(event_id);
            return Err(e.correlation_id(event_id));
        }
        Ok(())
    }

    /// Sends `event` as a reply-needed request and waits for every target.
    ///
    /// On timeout the pending registration is cancelled and later replies are
    /// dropped.
    pub async fn request<T: AsRef<str>>(
        &self,
        event: ControlEvent,
        targets: &[T],
        timeout: Duration,
    ) -> Result<Vec<Dispatch>> {
        let event = event.with_reply_needed(true);
        let event_id = event.event_id();
        let expected = targets.len();

        let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();
        let callback: Arc<dyn ReplyCallback> = Arc::new(move |dispatch: &Dispatch| {
            let _ = tx.send(dispatch.clone());
        });
        self.send_with_callback(&event, callback, targets).await?;

        let mut replies = Vec::with_capacity(expected);
        let gathered = with_timeout(
            async {
                while replies.len() < expected {
                    match rx.recv().await {
                        Some(dispatch) => replies.push(dispatch),
                        None => break,
                    }
                }
            },
            timeout,
        )
        .await;

        match gathered {
            Ok(()) => Ok(replies),
            Err(e) => {
                self.core.tracker.cancel(event_id);
                Err(e
                    .correlation_id(event_id)
                    .metadata("expected", serde_json::json!(expected))
                    .metadata("received", serde_json::json!(replies.len())))
            }
        }
    }

    /// Request using the configured default timeout
    pub async fn request_default<T: AsRef<str>>(
        &self,
        event: ControlEvent,
        targets: &[T],
    ) -> Result<Vec<Dispatch>> {
        let timeout = Duration::from_millis(self.config.default_request_timeout_ms);
        self.request(event, targets, timeout).await
    }

    /// Forgets a pending request; later replies to it are dropped
    pub fn cancel(&self, event_id: u64) -> bool {
        self.core.tracker.cancel(event_id)
    }

    pub fn subscribe(
        &self,
        event_type: EventType,
        listener_id: impl Into<String>,
        listener: Arc<dyn EventListener>,
    ) {
        self.core.listeners.subscribe(event_type, listener_id, listener);
    }

    pub fn unsubscribe(&self, event_type: EventType, listener_id: &str) -> bool {
        self.core.listeners.unsubscribe(event_type, listener_id)
    }

    /// Runs one inbound message through decode, correlation and fan-out
    pub fn handle_inbound(&self, message: TransportMessage) {
        self.core.handle_inbound(message);
    }

    pub fn pending_requests(&self) -> usize {
        self.core.tracker.pending_count()
    }

    pub fn stats(&self) -> CcpStats {
        let counters = &self.core.counters;
        CcpStats {
            sent: counters.sent.load(Ordering::Relaxed),
            received: counters.received.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            replies_matched: counters.replies_matched.load(Ordering::Relaxed),
            pending_requests: self.core.tracker.pending_count(),
        }
    }

    fn prepare<T: AsRef<str>>(
        &self,
        event: &ControlEvent,
        targets: &[T],
    ) -> Result<(Arc<dyn Publisher>, TransportMessage)> {
        if targets.is_empty() {
            return Err(Error::no_target(event.event_id()).source(self.state.name()));
        }
        let publisher = self.publisher.read().clone().ok_or_else(|| {
            Error::manager(
                self.state.name(),
                ManagerOperation::Operation("send".to_string()),
                "CCP manager is not started",
            )
        })?;

        let joined = targets
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(&TARGET_SEPARATOR.to_string());

        let mut message = self.transport.create_message();
        message.set_header(TARGET_OBJECTS, joined);
        message.set_header(EVENT_TYPE_HEADER, event.event_type().as_str());
        message.priority = event.header.priority;
        message.expiry = event.header.expiry;
        message.body = event.encode();
        Ok((publisher, message))
    }

    async fn publish(
        &self,
        publisher: &Arc<dyn Publisher>,
        event: &ControlEvent,
        message: TransportMessage,
    ) -> Result<()> {
        tracing::debug!(
            "Sending {} {} to [{}]",
            event.event_type(),
            event.event_id(),
            message.header(TARGET_OBJECTS).unwrap_or_default()
        );
        publisher.publish(message).await?;
        self.core.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Manager for CcpManager {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.start().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stop().await
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let stats = serde_json::to_value(self.stats())
            .with_context(|| "Failed to serialize CCP stats".to_string());
        match stats {
            Ok(serde_json::Value::Object(fields)) => {
                for (key, value) in fields {
                    status.add_metadata(key, value);
                }
            }
            Ok(_) => {}
            Err(e) => status.set_message(e.message),
        }
        status
    }
}
