// src/lib.rs

//! ESB CCP - Component Control Protocol core for a service bus control plane

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]
#![allow(clippy::large_enum_variant)]

pub mod ccp;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use ccp::{CcpManager, ControlEvent, Dispatch, EventType};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use lifecycle::{ComponentController, LifecycleStatus, LifecycleSupervisor};
pub use manager::{Manager, ManagerState, ManagerStatus};
pub use types::ServiceInstanceId;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
