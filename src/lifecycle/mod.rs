// src/lifecycle/mod.rs

//! Component lifecycle tracking
//!
//! Each managed instance has a [`LifecycleHandle`] (status plus history) and a
//! [`LaunchMechanism`] that actually hosts it. A [`ComponentController`] pairs
//! the two, and the [`LifecycleSupervisor`] feeds CCP handshakes and status
//! reports back into the handles.

pub mod controller;
pub mod handle;
pub mod launcher;
pub mod status;
pub mod supervisor;

pub use controller::ComponentController;
pub use handle::{LaunchConfiguration, LifecycleHandle, LifecycleSnapshot};
pub use launcher::{
    ComponentChannel, ContainerLauncher, ContainerRuntime, InProcessLauncher, LaunchMechanism,
    ProcessLauncher, INSTANCE_ID_ENV,
};
pub use status::{
    AuditCategory, AuditEvent, AuditSink, LifecycleStatus, MemoryAuditSink, TracingAuditSink,
};
pub use supervisor::{LifecycleSupervisor, SUPERVISOR_LISTENER_ID};
