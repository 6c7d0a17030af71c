// src/ccp/registry.rs

//! Closed-set dispatch from wire tags to empty variant instances.
//!
//! Decoding is two-step: construct the empty variant named by the tag, then
//! let it read its own fields. Adding a variant means adding a match arm here.

use bytes::Bytes;

use crate::ccp::data::{Data, DataType};
use crate::ccp::envelope::EventHeader;
use crate::ccp::event::{
    Command, ControlEvent, DataEvent, DataRequest, EventBody, EventType, Handshake, HandshakeAck,
    LogLevelRequest, Status,
};
use crate::ccp::wire::expect_end;
use crate::error::{Error, Result};

/// Empty body for an event type
pub fn empty_body(event_type: EventType) -> EventBody {
    match event_type {
        EventType::DataRequest => EventBody::DataRequest(DataRequest::default()),
        EventType::LogLevelRequest => EventBody::LogLevelRequest(LogLevelRequest::default()),
        EventType::Data => EventBody::Data(DataEvent::default()),
        EventType::Handshake => EventBody::Handshake(Handshake::default()),
        EventType::HandshakeAck => EventBody::HandshakeAck(HandshakeAck::default()),
        EventType::Command => EventBody::Command(Command::default()),
        EventType::Status => EventBody::Status(Status::default()),
    }
}

/// Empty payload for a data type
pub fn construct_data(data_type: DataType) -> Data {
    match data_type {
        DataType::MemoryUsage => Data::MemoryUsage(Default::default()),
        DataType::LogLevels => Data::LogLevels(Default::default()),
        DataType::ProcessId => Data::ProcessId(String::new()),
        DataType::ComponentStats => Data::ComponentStats(String::new()),
        DataType::MicroserviceConfiguration => Data::MicroserviceConfiguration(String::new()),
        DataType::NamedConfiguration => Data::NamedConfiguration(Default::default()),
        DataType::ManageableProperties => Data::ManageableProperties(Default::default()),
        DataType::PortConfiguration => Data::PortConfiguration(Vec::new()),
    }
}

/// Empty event instance for a wire tag
pub fn construct(tag: &str) -> Result<ControlEvent> {
    let event_type = EventType::from_wire(tag).ok_or_else(|| Error::unknown_type(tag))?;
    Ok(ControlEvent {
        header: EventHeader::blank(),
        body: empty_body(event_type),
    })
}

/// Empty data payload for a wire tag
pub fn construct_data_tag(tag: &str) -> Result<Data> {
    DataType::from_wire(tag)
        .map(construct_data)
        .ok_or_else(|| Error::unknown_type(tag))
}

/// Decodes a full message body whose type is named by `tag`
pub fn decode_event(tag: &str, mut body: Bytes) -> Result<ControlEvent> {
    let mut event = construct(tag)?;
    event
        .read_fields(&mut body)
        .and_then(|_| expect_end(&body))
        .map_err(|e| Error::codec(Some(tag), e.to_string()).caused_by(e))?;
    Ok(event)
}
