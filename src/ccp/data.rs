// src/ccp/data.rs

//! Data payloads carried by `DATA` events, keyed by [`DataType`].

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::ccp::wire::{wire_enum, Decode, Encode, WireResult};

wire_enum! {
    /// Closed set of data identifiers a component can be asked for
    pub enum DataType {
        MemoryUsage => "MEMORY_USAGE",
        LogLevels => "LOG_LEVELS",
        ProcessId => "PROCESS_ID",
        ComponentStats => "COMPONENT_STATS",
        MicroserviceConfiguration => "MICROSERVICE_CONFIGURATION",
        NamedConfiguration => "NAMED_CONFIGURATION",
        ManageableProperties => "MANAGEABLE_PROPERTIES",
        PortConfiguration => "PORT_CONFIGURATION",
    }
}

wire_enum! {
    /// Logger verbosity as exchanged with components
    pub enum LogLevel {
        Trace => "TRACE",
        Debug => "DEBUG",
        Info => "INFO",
        Warn => "WARN",
        Error => "ERROR",
        Off => "OFF",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub committed: u64,
    pub init: u64,
    pub max: u64,
    pub used: u64,
}

impl Encode for MemoryUsage {
    fn encode(&self, buf: &mut BytesMut) {
        self.committed.encode(buf);
        self.init.encode(buf);
        self.max.encode(buf);
        self.used.encode(buf);
    }
}

impl Decode for MemoryUsage {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            committed: u64::decode(buf)?,
            init: u64::decode(buf)?,
            max: u64::decode(buf)?,
            used: u64::decode(buf)?,
        })
    }
}

/// One runtime-editable component property
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManageableProperty {
    pub value: String,
    pub encrypted: bool,
    pub property_type: String,
    pub configuration_type: String,
}

impl Encode for ManageableProperty {
    fn encode(&self, buf: &mut BytesMut) {
        self.value.encode(buf);
        self.encrypted.encode(buf);
        self.property_type.encode(buf);
        self.configuration_type.encode(buf);
    }
}

impl Decode for ManageableProperty {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            value: String::decode(buf)?,
            encrypted: bool::decode(buf)?,
            property_type: String::decode(buf)?,
            configuration_type: String::decode(buf)?,
        })
    }
}

/// Binding of one component port to a bus destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfiguration {
    pub port_name: String,
    pub destination: String,
    pub properties: BTreeMap<String, String>,
}

impl Encode for PortConfiguration {
    fn encode(&self, buf: &mut BytesMut) {
        self.port_name.encode(buf);
        self.destination.encode(buf);
        self.properties.encode(buf);
    }
}

impl Decode for PortConfiguration {
    fn decode(buf: &mut Bytes) -> WireResult<Self> {
        Ok(Self {
            port_name: String::decode(buf)?,
            destination: String::decode(buf)?,
            properties: BTreeMap::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Data {
    MemoryUsage(MemoryUsage),
    LogLevels(BTreeMap<String, LogLevel>),
    ProcessId(String),
    ComponentStats(String),
    /// Opaque to the control plane
    MicroserviceConfiguration(String),
    NamedConfiguration(BTreeMap<String, String>),
    ManageableProperties(BTreeMap<String, ManageableProperty>),
    PortConfiguration(Vec<PortConfiguration>),
}

impl Data {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::MemoryUsage(_) => DataType::MemoryUsage,
            Self::LogLevels(_) => DataType::LogLevels,
            Self::ProcessId(_) => DataType::ProcessId,
            Self::ComponentStats(_) => DataType::ComponentStats,
            Self::MicroserviceConfiguration(_) => DataType::MicroserviceConfiguration,
            Self::NamedConfiguration(_) => DataType::NamedConfiguration,
            Self::ManageableProperties(_) => DataType::ManageableProperties,
            Self::PortConfiguration(_) => DataType::PortConfiguration,
        }
    }

    pub(crate) fn encode_fields(&self, buf: &mut BytesMut) {
        match self {
            Self::MemoryUsage(usage) => usage.encode(buf),
            Self::LogLevels(levels) => levels.encode(buf),
            Self::ProcessId(pid) => pid.encode(buf),
            Self::ComponentStats(stats) => stats.encode(buf),
            Self::MicroserviceConfiguration(config) => config.encode(buf),
            Self::NamedConfiguration(config) => config.encode(buf),
            Self::ManageableProperties(properties) => properties.encode(buf),
            Self::PortConfiguration(ports) => ports.encode(buf),
        }
    }

    /// Fills an empty instance (see `registry::construct_data`) from the body
    pub(crate) fn read_fields(&mut self, buf: &mut Bytes) -> WireResult<()> {
        match self {
            Self::MemoryUsage(usage) => *usage = MemoryUsage::decode(buf)?,
            Self::LogLevels(levels) => *levels = BTreeMap::decode(buf)?,
            Self::ProcessId(pid) => *pid = String::decode(buf)?,
            Self::ComponentStats(stats) => *stats = String::decode(buf)?,
            Self::MicroserviceConfiguration(config) => *config = String::decode(buf)?,
            Self::NamedConfiguration(config) => *config = BTreeMap::decode(buf)?,
            Self::ManageableProperties(properties) => *properties = BTreeMap::decode(buf)?,
            Self::PortConfiguration(ports) => *ports = Vec::decode(buf)?,
        }
        Ok(())
    }
}
