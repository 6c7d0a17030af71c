// src/transport/mod.rs

//! Pub/sub transport seam.
//!
//! The protocol core only needs to publish a binary body with a header map and
//! to receive the same asynchronously. Brokers plug in by implementing
//! [`Transport`]; [`InMemoryTransport`] serves tests and local runs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ccp::{TARGET_OBJECTS, TARGET_SEPARATOR};
use crate::error::Result;

pub mod memory;

pub use memory::InMemoryTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    /// Every matching subscriber receives each message
    Topic,
    /// One matching subscriber receives each message
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationHandle {
    pub name: String,
    pub kind: DestinationKind,
}

/// Binary message with transport-level headers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportMessage {
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub priority: i32,
    /// Epoch milliseconds, `-1` for never
    pub expiry: i64,
}

impl TransportMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Entries of the `TARGET_OBJECTS` header
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.header(TARGET_OBJECTS)
            .unwrap_or_default()
            .split(TARGET_SEPARATOR)
            .filter(|target| !target.is_empty())
    }
}

/// Subscription-side selection of messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MessageFilter {
    #[default]
    All,
    /// Only messages whose `TARGET_OBJECTS` names this identifier
    Target(String),
}

impl MessageFilter {
    pub fn matches(&self, message: &TransportMessage) -> bool {
        match self {
            Self::All => true,
            Self::Target(id) => message.targets().any(|target| target == id),
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync + fmt::Debug {
    async fn publish(&self, message: TransportMessage) -> Result<()>;
}

/// Called on the transport's delivery task for every received message
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: TransportMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(TransportMessage) + Send + Sync,
{
    fn on_message(&self, message: TransportMessage) {
        self(message)
    }
}

/// Live subscription; closing or dropping it stops delivery
pub struct Subscription {
    pub id: Uuid,
    pub destination: String,
    closer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        destination: impl Into<String>,
        closer: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination: destination.into(),
            closer: Some(Box::new(closer)),
        }
    }

    pub fn close(mut self) {
        self.run_closer();
    }

    fn run_closer(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_closer();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn enable_destination(&self, name: &str, kind: DestinationKind)
        -> Result<DestinationHandle>;

    async fn create_publisher(&self, destination: &DestinationHandle) -> Result<Arc<dyn Publisher>>;

    async fn subscribe(
        &self,
        destination: &DestinationHandle,
        filter: MessageFilter,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription>;

    fn create_message(&self) -> TransportMessage {
        TransportMessage {
            expiry: -1,
            ..TransportMessage::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_filter() {
        let mut message = TransportMessage::default();
        message.set_header(TARGET_OBJECTS, "App1__comp1;App1__comp2");

        assert!(MessageFilter::All.matches(&message));
        assert!(MessageFilter::Target("App1__comp2".to_string()).matches(&message));
        assert!(!MessageFilter::Target("App1__comp".to_string()).matches(&message));
        assert_eq!(message.targets().count(), 2);
    }

    #[test]
    fn test_missing_target_header_matches_nobody() {
        let message = TransportMessage::default();
        assert!(!MessageFilter::Target("App1__comp1".to_string()).matches(&message));
    }
}
