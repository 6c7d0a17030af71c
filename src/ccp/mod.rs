// src/ccp/mod.rs

//! Component Control Protocol
//!
//! Typed request/reply and broadcast events exchanged between the control
//! plane and managed component instances over a pub/sub transport:
//! - Positional binary encoding of a closed set of event and payload variants
//! - Scatter/gather correlation of replies to the request that caused them
//! - Per-type broadcast listeners that observe every inbound event
//!
//! Every decoded inbound event goes down both paths. A reply that satisfies a
//! pending request is also seen by listeners of its type.

pub mod wire;

pub mod correlation;
pub mod data;
pub mod endpoint;
pub mod envelope;
pub mod event;
pub mod listener;
pub mod manager;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use correlation::{CorrelationTracker, ReplyCallback};
pub use data::{Data, DataType, LogLevel, ManageableProperty, MemoryUsage, PortConfiguration};
pub use endpoint::{BasicComponent, ComponentEndpoint, ControlHandler};
pub use envelope::{EventHeader, DEFAULT_PRIORITY, NEVER, PROTOCOL_VERSION};
pub use event::{
    Command, CommandKind, ComponentState, ControlEvent, DataEvent, DataRequest, EventBody,
    EventType, Handshake, HandshakeAck, LogLevelRequest, Status,
};
pub use listener::{EventListener, ListenerRegistry};
pub use manager::{CcpManager, CcpStats};

/// `;`-joined `<applicationId>__<instanceName>` list of intended receivers
pub const TARGET_OBJECTS: &str = "TARGET_OBJECTS";
/// Sender's `<applicationId>__<instanceName>`, set on inbound traffic
pub const SOURCE_OBJECT: &str = "SOURCE_OBJECT";
/// Wire name of the event type in the body
pub const EVENT_TYPE_HEADER: &str = "EVENT_TYPE_HEADER";
/// Separator inside `TARGET_OBJECTS`
pub const TARGET_SEPARATOR: char = ';';

/// A decoded inbound event together with the component that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub source: String,
    pub event: ControlEvent,
}

impl Dispatch {
    pub fn new(source: impl Into<String>, event: ControlEvent) -> Self {
        Self {
            source: source.into(),
            event,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }
}
