// src/ccp/event.rs

//! Control events: the envelope plus one variant body from a closed set.
//!
//! Every body encodes its own fields after the envelope, in the order they are
//! declared here. New fields may only ever be appended.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::ccp::data::{Data, DataType, LogLevel};
use crate::ccp::envelope::EventHeader;
use crate::ccp::registry;
use crate::ccp::wire::{wire_enum, Decode, Encode, WireError, WireResult};

wire_enum! {
    /// Wire type tag, carried in the `EVENT_TYPE_HEADER` message header
    pub enum EventType {
        DataRequest => "DATA_REQUEST",
        LogLevelRequest => "LOG_LEVEL_REQUEST",
        Data => "DATA",
        Handshake => "HANDSHAKE",
        HandshakeAck => "HANDSHAKE_ACK",
        Command => "COMMAND",
        Status => "STATUS",
    }
}

wire_enum! {
    /// Run state a component reports about itself
    pub enum ComponentState {
        Starting => "STARTING",
        Running => "RUNNING",
        Stopping => "STOPPING",
        Stopped => "STOPPED",
        Error => "ERROR",
    }
}

/// Asks the target to keep replying `count` times, every `interval_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Periodic {
    pub count: u32,
    pub interval_ms: u64,
}

impl Encode for Periodic {
    fn encode(&self, buf: &mut BytesMut) {
        self.count.encode(buf);
        self.interval_ms.encode(buf);
    }
}

impl Decode for Periodic {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            count: u32::decode(buf)?,
            interval_ms: u64::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub data_types: BTreeSet<DataType>,
    pub periodic: Option<Periodic>,
}

impl DataRequest {
    pub fn new(data_types: impl IntoIterator<Item = DataType>) -> Self {
        Self {
            data_types: data_types.into_iter().collect(),
            periodic: None,
        }
    }

    pub fn every(mut self, count: u32, interval_ms: u64) -> Self {
        self.periodic = Some(Periodic { count, interval_ms });
        self
    }
}

impl Encode for DataRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.data_types.encode(buf);
        self.periodic.encode(buf);
    }
}

impl Decode for DataRequest {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            data_types: BTreeSet::decode(buf)?,
            periodic: Option::decode(buf)?,
        })
    }
}

/// Data request narrowed to the `LOG_LEVELS` identifier and a set of loggers.
///
/// Shares the data-request layout: identifier set (always one entry), the
/// periodic slot (always empty), then the logger names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLevelRequest {
    pub data_type: DataType,
    pub logger_names: BTreeSet<String>,
}

impl LogLevelRequest {
    pub fn new(logger_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            data_type: DataType::LogLevels,
            logger_names: logger_names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for LogLevelRequest {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl Encode for LogLevelRequest {
    fn encode(&self, buf: &mut BytesMut) {
        DataRequest::new([self.data_type]).encode(buf);
        self.logger_names.encode(buf);
    }
}

impl Decode for LogLevelRequest {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        let request = DataRequest::decode(buf)?;
        if request.periodic.is_some() {
            return Err(WireError::Invalid(
                "log level request cannot be periodic".to_string(),
            ));
        }
        let mut identifiers = request.data_types.into_iter();
        let data_type = match (identifiers.next(), identifiers.next()) {
            (Some(only), None) => only,
            _ => {
                return Err(WireError::Invalid(
                    "log level request must carry exactly one data identifier".to_string(),
                ))
            }
        };
        Ok(Self {
            data_type,
            logger_names: BTreeSet::decode(buf)?,
        })
    }
}

/// Reply payloads keyed by their own data type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    pub data: BTreeMap<DataType, Data>,
}

impl DataEvent {
    pub fn with(mut self, data: Data) -> Self {
        self.insert(data);
        self
    }

    pub fn insert(&mut self, data: Data) {
        self.data.insert(data.data_type(), data);
    }

    pub fn get(&self, data_type: DataType) -> Option<&Data> {
        self.data.get(&data_type)
    }
}

impl Encode for DataEvent {
    fn encode(&self, buf: &mut BytesMut) {
        (self.data.len() as u32).encode(buf);
        for (data_type, data) in &self.data {
            data_type.encode(buf);
            data.encode_fields(buf);
        }
    }
}

impl Decode for DataEvent {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        let count = u32::decode(buf)?;
        let mut data = BTreeMap::new();
        for _ in 0..count {
            let data_type = DataType::decode(buf)?;
            let mut payload = registry::construct_data(data_type);
            payload.read_fields(buf)?;
            data.insert(data_type, payload);
        }
        Ok(Self { data })
    }
}

/// First message from a freshly launched component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub component_version: String,
    pub process_id: String,
}

impl Encode for Handshake {
    fn encode(&self, buf: &mut BytesMut) {
        self.component_version.encode(buf);
        self.process_id.encode(buf);
    }
}

impl Decode for Handshake {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            component_version: String::decode(buf)?,
            process_id: String::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub accepted: bool,
    pub reason: String,
}

impl Encode for HandshakeAck {
    fn encode(&self, buf: &mut BytesMut) {
        self.accepted.encode(buf);
        self.reason.encode(buf);
    }
}

impl Decode for HandshakeAck {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            accepted: bool::decode(buf)?,
            reason: String::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Stop,
    Kill,
    Restart,
    SetLogLevel,
    Custom(String),
}

impl CommandKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "STOP",
            Self::Kill => "KILL",
            Self::Restart => "RESTART",
            Self::SetLogLevel => "SET_LOG_LEVEL",
            Self::Custom(name) => name,
        }
    }

    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "STOP" => Self::Stop,
            "KILL" => Self::Kill,
            "RESTART" => Self::Restart,
            "SET_LOG_LEVEL" => Self::SetLogLevel,
            other => Self::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub arguments: BTreeMap<String, String>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            arguments: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// `SET_LOG_LEVEL` command whose arguments map logger name to level
    pub fn set_log_level(levels: &BTreeMap<String, LogLevel>) -> Self {
        levels
            .iter()
            .fold(Self::new(CommandKind::SetLogLevel), |cmd, (logger, level)| {
                cmd.arg(logger.clone(), level.as_str())
            })
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::new(CommandKind::Custom(String::new()))
    }
}

impl Encode for Command {
    fn encode(&self, buf: &mut BytesMut) {
        crate::ccp::wire::put_str(buf, self.kind.as_str());
        self.arguments.encode(buf);
    }
}

impl Decode for Command {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            kind: CommandKind::from_wire(&String::decode(buf)?),
            arguments: BTreeMap::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: ComponentState,
    pub message: String,
}

impl Status {
    pub fn new(state: ComponentState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new(ComponentState::Starting, "")
    }
}

impl Encode for Status {
    fn encode(&self, buf: &mut BytesMut) {
        self.state.encode(buf);
        self.message.encode(buf);
    }
}

impl Decode for Status {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            state: ComponentState::decode(buf)?,
            message: String::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum EventBody {
    DataRequest(DataRequest),
    LogLevelRequest(LogLevelRequest),
    Data(DataEvent),
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Command(Command),
    Status(Status),
}

impl EventBody {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::DataRequest(_) => EventType::DataRequest,
            Self::LogLevelRequest(_) => EventType::LogLevelRequest,
            Self::Data(_) => EventType::Data,
            Self::Handshake(_) => EventType::Handshake,
            Self::HandshakeAck(_) => EventType::HandshakeAck,
            Self::Command(_) => EventType::Command,
            Self::Status(_) => EventType::Status,
        }
    }

    fn encode_fields(&self, buf: &mut BytesMut) {
        match self {
            Self::DataRequest(body) => body.encode(buf),
            Self::LogLevelRequest(body) => body.encode(buf),
            Self::Data(body) => body.encode(buf),
            Self::Handshake(body) => body.encode(buf),
            Self::HandshakeAck(body) => body.encode(buf),
            Self::Command(body) => body.encode(buf),
            Self::Status(body) => body.encode(buf),
        }
    }

    fn read_fields(&mut self, buf: &mut Bytes) -> WireResult<()> {
        match self {
            Self::DataRequest(body) => *body = DataRequest::decode(buf)?,
            Self::LogLevelRequest(body) => *body = LogLevelRequest::decode(buf)?,
            Self::Data(body) => *body = DataEvent::decode(buf)?,
            Self::Handshake(body) => *body = Handshake::decode(buf)?,
            Self::HandshakeAck(body) => *body = HandshakeAck::decode(buf)?,
            Self::Command(body) => *body = Command::decode(buf)?,
            Self::Status(body) => *body = Status::decode(buf)?,
        }
        Ok(())
    }
}

macro_rules! body_from {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        $(
            impl From<$ty> for EventBody {
                fn from(body: $ty) -> Self {
                    Self::$variant(body)
                }
            }
        )+
    };
}

body_from!(
    DataRequest(DataRequest),
    LogLevelRequest(LogLevelRequest),
    Data(DataEvent),
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Command(Command),
    Status(Status),
);

/// A complete control event: envelope plus body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub header: EventHeader,
    pub body: EventBody,
}

impl ControlEvent {
    /// New event with a fresh id and default envelope
    pub fn new(body: impl Into<EventBody>) -> Self {
        Self {
            header: EventHeader::new(),
            body: body.into(),
        }
    }

    /// Reply to `request`: carries its event id as correlation id
    pub fn reply_to(request: &ControlEvent, body: impl Into<EventBody>) -> Self {
        let mut reply = Self::new(body);
        reply.header.correlation_id = request.header.event_id;
        reply.header.priority = request.header.priority;
        reply
    }

    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }

    pub fn event_id(&self) -> u64 {
        self.header.event_id
    }

    pub fn correlation_id(&self) -> u64 {
        self.header.correlation_id
    }

    pub fn reply_needed(&self) -> bool {
        self.header.reply_needed
    }

    pub fn with_reply_needed(mut self, reply_needed: bool) -> Self {
        self.header.reply_needed = reply_needed;
        self
    }

    pub fn with_reply_timeout(mut self, millis: i64) -> Self {
        self.header.reply_timeout = millis;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn with_expiry(mut self, expiry: i64) -> Self {
        self.header.expiry = expiry;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.header.description = description.into();
        self
    }

    /// Positional body: envelope fields, then the variant's fields
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.header.encode(&mut buf);
        self.body.encode_fields(&mut buf);
        buf.freeze()
    }

    /// Fills an empty instance produced by `registry::construct`
    pub(crate) fn read_fields(&mut self, buf: &mut Bytes) -> WireResult<()> {
        self.header = EventHeader::decode(buf)?;
        self.body.read_fields(buf)
    }
}
