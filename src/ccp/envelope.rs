// src/ccp/envelope.rs

//! Common header carried by every control event.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::ccp::wire::{Decode, Encode, WireResult};
use crate::utils::Time;

/// Advisory protocol version stamped on outgoing events. Never checked on decode.
pub const PROTOCOL_VERSION: f32 = 1.0;

/// Mid-range of the 0..=9 message priority scale
pub const DEFAULT_PRIORITY: i32 = 4;

/// Expiry / timeout sentinel meaning "never" / "unbounded"
pub const NEVER: i64 = -1;

/// Correlation id carried by events that are not replies
pub const NO_CORRELATION: u64 = 0;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out process-unique, increasing event ids
pub fn next_event_id() -> u64 {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Envelope fields, encoded in declaration order ahead of every body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_id: u64,
    pub version: f32,
    /// Generation time, epoch milliseconds
    pub timestamp: i64,
    pub description: String,
    pub priority: i32,
    /// Epoch milliseconds, or [`NEVER`]
    pub expiry: i64,
    pub reply_needed: bool,
    /// Milliseconds, or [`NEVER`]. Metadata only.
    pub reply_timeout: i64,
    pub correlation_id: u64,
}

impl EventHeader {
    /// Fresh header with a new event id and the current time
    pub fn new() -> Self {
        Self {
            event_id: next_event_id(),
            timestamp: Time::now_millis(),
            ..Self::blank()
        }
    }

    /// All-default header used as a decode target
    pub fn blank() -> Self {
        Self {
            event_id: 0,
            version: PROTOCOL_VERSION,
            timestamp: 0,
            description: String::new(),
            priority: DEFAULT_PRIORITY,
            expiry: NEVER,
            reply_needed: false,
            reply_timeout: NEVER,
            correlation_id: NO_CORRELATION,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.correlation_id != NO_CORRELATION
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl Encode for EventHeader {
    fn encode(&self, buf: &mut BytesMut) {
        self.event_id.encode(buf);
        self.version.encode(buf);
        self.timestamp.encode(buf);
        self.description.encode(buf);
        self.priority.encode(buf);
        self.expiry.encode(buf);
        self.reply_needed.encode(buf);
        self.reply_timeout.encode(buf);
        self.correlation_id.encode(buf);
    }
}

impl Decode for EventHeader {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            event_id: u64::decode(buf)?,
            version: f32::decode(buf)?,
            timestamp: i64::decode(buf)?,
            description: String::decode(buf)?,
            priority: i32::decode(buf)?,
            expiry: i64::decode(buf)?,
            reply_needed: bool::decode(buf)?,
            reply_timeout: i64::decode(buf)?,
            correlation_id: u64::decode(buf)?,
        })
    }
}
