// src/transport/memory.rs

//! In-process transport backed by tokio channels.
//!
//! Each subscription owns one delivery task, so handlers for a single
//! subscription run sequentially while different subscriptions run
//! concurrently, the way a broker client's session threads behave.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result, TransportOperation};
use crate::transport::{
    DestinationHandle, DestinationKind, MessageFilter, MessageHandler, Publisher, Subscription,
    Transport, TransportMessage,
};

struct Subscriber {
    id: Uuid,
    filter: MessageFilter,
    sender: mpsc::UnboundedSender<TransportMessage>,
}

struct Destination {
    kind: DestinationKind,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct Broker {
    destinations: DashMap<String, Destination>,
    fail_publish: AtomicBool,
    published: AtomicU64,
}

impl Broker {
    fn route(&self, name: &str, message: TransportMessage) -> Result<usize> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::transport(
                Some(name),
                TransportOperation::Publish,
                "Broker rejected publish",
            ));
        }

        let mut destination = self.destinations.get_mut(name).ok_or_else(|| {
            Error::transport(
                Some(name),
                TransportOperation::Publish,
                format!("Destination '{}' is not enabled", name),
            )
        })?;
        self.published.fetch_add(1, Ordering::Relaxed);

        let kind = destination.kind;
        let mut delivered = 0;
        // Subscribers whose delivery task has gone away are pruned here.
        destination.subscribers.retain(|subscriber| {
            if kind == DestinationKind::Queue && delivered > 0 {
                return true;
            }
            if !subscriber.filter.matches(&message) {
                return true;
            }
            match subscriber.sender.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        Ok(delivered)
    }
}

/// Shared in-memory broker; clones talk to the same destinations
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("destinations", &self.broker.destinations.len())
            .field("published", &self.published_count())
            .finish()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish fail until switched off again
    pub fn set_fail_publish(&self, fail: bool) {
        self.broker.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published_count(&self) -> u64 {
        self.broker.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.broker
            .destinations
            .get(destination)
            .map(|d| d.subscribers.len())
            .unwrap_or(0)
    }
}

struct InMemoryPublisher {
    destination: String,
    broker: Arc<Broker>,
}

impl std::fmt::Debug for InMemoryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPublisher")
            .field("destination", &self.destination)
            .finish()
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, message: TransportMessage) -> Result<()> {
        let delivered = self.broker.route(&self.destination, message)?;
        tracing::trace!("Published to '{}' ({} receivers)", self.destination, delivered);
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn enable_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> Result<DestinationHandle> {
        let entry = self
            .broker
            .destinations
            .entry(name.to_string())
            .or_insert_with(|| Destination {
                kind,
                subscribers: Vec::new(),
            });
        if entry.kind != kind {
            return Err(Error::transport(
                Some(name),
                TransportOperation::EnableDestination,
                format!("Destination '{}' already exists as {:?}", name, entry.kind),
            ));
        }
        Ok(DestinationHandle {
            name: name.to_string(),
            kind,
        })
    }

    async fn create_publisher(&self, destination: &DestinationHandle) -> Result<Arc<dyn Publisher>> {
        if !self.broker.destinations.contains_key(&destination.name) {
            return Err(Error::transport(
                Some(&destination.name),
                TransportOperation::CreatePublisher,
                "Destination is not enabled",
            ));
        }
        Ok(Arc::new(InMemoryPublisher {
            destination: destination.name.clone(),
            broker: Arc::clone(&self.broker),
        }))
    }

    async fn subscribe(
        &self,
        destination: &DestinationHandle,
        filter: MessageFilter,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<TransportMessage>();
        let id = {
            let mut entry = self
                .broker
                .destinations
                .get_mut(&destination.name)
                .ok_or_else(|| {
                    Error::transport(
                        Some(&destination.name),
                        TransportOperation::Subscribe,
                        "Destination is not enabled",
                    )
                })?;
            let id = Uuid::new_v4();
            entry.subscribers.push(Subscriber { id, filter, sender });
            id
        };

        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                handler.on_message(message);
            }
        });

        let broker = Arc::clone(&self.broker);
        let name = destination.name.clone();
        Ok(Subscription::new(destination.name.clone(), move || {
            if let Some(mut entry) = broker.destinations.get_mut(&name) {
                entry.subscribers.retain(|subscriber| subscriber.id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccp::TARGET_OBJECTS;
    use std::time::Duration;

    fn channel_handler() -> (
        Arc<dyn MessageHandler>,
        mpsc::UnboundedReceiver<TransportMessage>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |message: TransportMessage| {
            let _ = tx.send(message);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_topic_delivers_to_matching_subscribers() {
        let transport = InMemoryTransport::new();
        let topic = transport
            .enable_destination("ccp.components", DestinationKind::Topic)
            .await
            .unwrap();
        let (h1, mut rx1) = channel_handler();
        let (h2, mut rx2) = channel_handler();
        let _s1 = transport
            .subscribe(&topic, MessageFilter::Target("App1__comp1".into()), h1)
            .await
            .unwrap();
        let _s2 = transport
            .subscribe(&topic, MessageFilter::Target("App1__comp2".into()), h2)
            .await
            .unwrap();

        let publisher = transport.create_publisher(&topic).await.unwrap();
        let mut message = transport.create_message();
        message.set_header(TARGET_OBJECTS, "App1__comp1");
        publisher.publish(message).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.header(TARGET_OBJECTS), Some("App1__comp1"));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_delivery() {
        let transport = InMemoryTransport::new();
        let topic = transport
            .enable_destination("ccp.control", DestinationKind::Topic)
            .await
            .unwrap();
        let (handler, _rx) = channel_handler();
        let subscription = transport
            .subscribe(&topic, MessageFilter::All, handler)
            .await
            .unwrap();
        assert_eq!(transport.subscriber_count("ccp.control"), 1);
        subscription.close();
        assert_eq!(transport.subscriber_count("ccp.control"), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_unsubscribes() {
        let transport = InMemoryTransport::new();
        let topic = transport
            .enable_destination("ccp.control", DestinationKind::Topic)
            .await
            .unwrap();
        let (handler, _rx) = channel_handler();
        let subscription = transport
            .subscribe(&topic, MessageFilter::All, handler)
            .await
            .unwrap();
        assert_eq!(transport.subscriber_count("ccp.control"), 1);
        drop(subscription);
        assert_eq!(transport.subscriber_count("ccp.control"), 0);
    }

    #[tokio::test]
    async fn test_publisher_debug_names_destination() {
        let transport = InMemoryTransport::new();
        let topic = transport
            .enable_destination("ccp.components", DestinationKind::Topic)
            .await
            .unwrap();
        let publisher = transport.create_publisher(&topic).await.unwrap();
        assert!(format!("{:?}", publisher).contains("ccp.components"));
    }

    #[tokio::test]
    async fn test_publish_failures() {
        let transport = InMemoryTransport::new();
        let topic = transport
            .enable_destination("ccp.control", DestinationKind::Topic)
            .await
            .unwrap();
        let publisher = transport.create_publisher(&topic).await.unwrap();

        transport.set_fail_publish(true);
        assert!(publisher.publish(transport.create_message()).await.is_err());
        transport.set_fail_publish(false);
        assert!(publisher.publish(transport.create_message()).await.is_ok());
        assert_eq!(transport.published_count(), 1);
    }

    #[tokio::test]
    async fn test_destination_kind_conflict() {
        let transport = InMemoryTransport::new();
        transport
            .enable_destination("ccp.control", DestinationKind::Topic)
            .await
            .unwrap();
        assert!(transport
            .enable_destination("ccp.control", DestinationKind::Queue)
            .await
            .is_err());
    }
}
