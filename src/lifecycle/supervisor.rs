// src/lifecycle/supervisor.rs

//! Turns inbound CCP traffic into lifecycle transitions.
//!
//! Registered on the [`CcpManager`] as a listener for `HANDSHAKE` and
//! `STATUS`. Listener callbacks are synchronous, so acknowledgements are
//! published from a spawned task.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::ccp::{
    CcpManager, ComponentState, ControlEvent, Dispatch, EventBody, EventListener, EventType,
    HandshakeAck,
};
use crate::error::{Error, LifecycleOperation, Result};
use crate::lifecycle::controller::ComponentController;
use crate::lifecycle::handle::LifecycleSnapshot;
use crate::lifecycle::status::LifecycleStatus;

/// Listener id used for both subscriptions
pub const SUPERVISOR_LISTENER_ID: &str = "lifecycle-supervisor";

#[derive(Debug)]
pub struct LifecycleSupervisor {
    ccp: Arc<CcpManager>,
    controllers: DashMap<String, Arc<ComponentController>>,
}

impl LifecycleSupervisor {
    /// Creates the supervisor and subscribes it to `ccp`
    pub fn attach(ccp: Arc<CcpManager>) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            ccp: Arc::clone(&ccp),
            controllers: DashMap::new(),
        });
        let listener: Arc<dyn EventListener> = Arc::new(SupervisorListener {
            supervisor: Arc::downgrade(&supervisor),
        });
        ccp.subscribe(EventType::Handshake, SUPERVISOR_LISTENER_ID, Arc::clone(&listener));
        ccp.subscribe(EventType::Status, SUPERVISOR_LISTENER_ID, listener);
        supervisor
    }

    pub fn detach(&self) {
        self.ccp.unsubscribe(EventType::Handshake, SUPERVISOR_LISTENER_ID);
        self.ccp.unsubscribe(EventType::Status, SUPERVISOR_LISTENER_ID);
    }

    /// Adds `controller`; an instance id may only be registered once
    pub fn register(&self, controller: Arc<ComponentController>) -> Result<()> {
        let key = controller.instance_id().to_string();
        if self.controllers.contains_key(&key) {
            return Err(Error::lifecycle(
                key,
                LifecycleOperation::Launch,
                "Instance is already supervised",
            ));
        }
        self.controllers.insert(key, controller);
        Ok(())
    }

    pub fn remove(&self, instance_id: &str) -> Option<Arc<ComponentController>> {
        self.controllers.remove(instance_id).map(|(_, controller)| controller)
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<ComponentController>> {
        self.controllers
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Snapshots of every supervised instance, ordered by instance id
    pub fn snapshots(&self) -> Vec<LifecycleSnapshot> {
        let mut snapshots: Vec<_> = self
            .controllers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        snapshots
    }

    /// Stops every active instance concurrently; results are keyed by instance id
    pub async fn stop_all(&self) -> Vec<(String, Result<()>)> {
        let active: Vec<Arc<ComponentController>> = self
            .controllers
            .iter()
            .filter(|entry| entry.value().status().is_active())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let stops = active.iter().map(|controller| async move {
            (controller.instance_id().to_string(), controller.stop().await)
        });
        futures::future::join_all(stops).await
    }

    fn on_handshake(&self, dispatch: &Dispatch) {
        let ack = match self.get(&dispatch.source) {
            None => HandshakeAck {
                accepted: false,
                reason: format!("unknown instance '{}'", dispatch.source),
            },
            Some(controller) => match controller.status() {
                LifecycleStatus::Bounding => match controller.handle().confirm_launch() {
                    Ok(()) => HandshakeAck {
                        accepted: true,
                        reason: String::new(),
                    },
                    Err(e) => HandshakeAck {
                        accepted: false,
                        reason: e.message,
                    },
                },
                LifecycleStatus::Bound => HandshakeAck {
                    accepted: false,
                    reason: "duplicate instance".to_string(),
                },
                other => HandshakeAck {
                    accepted: false,
                    reason: format!("instance is {}", other),
                },
            },
        };

        if !ack.accepted {
            tracing::warn!("Rejecting handshake from '{}': {}", dispatch.source, ack.reason);
        }
        self.acknowledge(dispatch, ack);
    }

    fn acknowledge(&self, dispatch: &Dispatch, ack: HandshakeAck) {
        let mut reply = ControlEvent::reply_to(&dispatch.event, ack);
        reply.header.version = self.ccp.config().protocol_version;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("No runtime to acknowledge '{}'", dispatch.source);
            return;
        };
        let ccp = Arc::clone(&self.ccp);
        let target = dispatch.source.clone();
        runtime.spawn(async move {
            if let Err(e) = ccp.send(&reply, &[target.as_str()]).await {
                tracing::error!("Failed to acknowledge '{}': {}", target, e);
            }
        });
    }

    /// Only unsolicited reports count; replies to our own STOP are the controller's
    fn on_status(&self, dispatch: &Dispatch) -> Result<()> {
        let EventBody::Status(status) = &dispatch.event.body else {
            return Ok(());
        };
        if dispatch.event.header.is_reply() {
            return Ok(());
        }
        let Some(controller) = self.get(&dispatch.source) else {
            tracing::debug!("Status from unsupervised '{}'", dispatch.source);
            return Ok(());
        };

        match status.state {
            ComponentState::Stopped if controller.status() == LifecycleStatus::Bound => {
                controller.handle().mark_stopped()
            }
            ComponentState::Error => {
                tracing::warn!("'{}' reports error: {}", dispatch.source, status.message);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

struct SupervisorListener {
    supervisor: Weak<LifecycleSupervisor>,
}

impl EventListener for SupervisorListener {
    fn on_event(&self, dispatch: &Dispatch) -> Result<()> {
        let Some(supervisor) = self.supervisor.upgrade() else {
            return Ok(());
        };
        match dispatch.event_type() {
            EventType::Handshake => {
                supervisor.on_handshake(dispatch);
                Ok(())
            }
            EventType::Status => supervisor.on_status(dispatch),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ccp::{ComponentEndpoint, ControlHandler, Status};
    use crate::config::{CcpConfig, LifecycleConfig};
    use crate::lifecycle::handle::LaunchConfiguration;
    use crate::lifecycle::launcher::{InProcessLauncher, LaunchMechanism};
    use crate::lifecycle::status::MemoryAuditSink;
    use crate::transport::{InMemoryTransport, Transport};
    use crate::types::ServiceInstanceId;

    struct Setup {
        ccp: Arc<CcpManager>,
        transport: Arc<dyn Transport>,
        supervisor: Arc<LifecycleSupervisor>,
        sink: MemoryAuditSink,
    }

    async fn setup() -> Setup {
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
        let ccp = Arc::new(CcpManager::new(CcpConfig::default(), Arc::clone(&transport)));
        ccp.start().await.unwrap();
        let supervisor = LifecycleSupervisor::attach(Arc::clone(&ccp));
        Setup {
            ccp,
            transport,
            supervisor,
            sink: MemoryAuditSink::new(),
        }
    }

    fn supervise(setup: &Setup, name: &str) -> Arc<ComponentController> {
        let launch = LaunchConfiguration::new(ServiceInstanceId::new("App1", name));
        let mechanism = LaunchMechanism::InProcess(InProcessLauncher::new(
            CcpConfig::default(),
            Arc::clone(&setup.transport),
        ));
        let controller = Arc::new(ComponentController::new(
            launch,
            mechanism,
            Arc::clone(&setup.ccp),
            Arc::new(setup.sink.clone()),
            &LifecycleConfig::default(),
        ));
        setup.supervisor.register(Arc::clone(&controller)).unwrap();
        controller
    }

    async fn wait_for_status(controller: &ComponentController, status: LifecycleStatus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while controller.status() != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_binds_instance() {
        let setup = setup().await;
        let controller = supervise(&setup, "comp1");

        controller.launch().await.unwrap();
        wait_for_status(&controller, LifecycleStatus::Bound).await;
        assert_eq!(
            setup.sink.statuses(),
            vec![LifecycleStatus::Bounding, LifecycleStatus::Bound]
        );

        controller.stop().await.unwrap();
        assert_eq!(controller.status(), LifecycleStatus::Unbound);
        assert_eq!(setup.sink.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_handshake_is_rejected() {
        let setup = setup().await;
        let controller = supervise(&setup, "comp1");
        controller.launch().await.unwrap();
        wait_for_status(&controller, LifecycleStatus::Bound).await;

        let intruder = Arc::new(crate::ccp::BasicComponent::new("1.0.0", "999"));
        let endpoint = ComponentEndpoint::connect(
            &CcpConfig::default(),
            Arc::clone(&setup.transport),
            "App1__comp1".parse().unwrap(),
            Arc::clone(&intruder) as Arc<dyn ControlHandler>,
        )
        .await
        .unwrap();
        let mut stopped = intruder.stopped();
        intruder.announce(&endpoint).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), stopped.wait_for(|stop| *stop))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(controller.status(), LifecycleStatus::Bound);
        assert!(controller.is_running().await.unwrap());
        endpoint.close();
        controller.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_stopped_unbinds() {
        let setup = setup().await;
        let controller = supervise(&setup, "comp1");
        controller.launch().await.unwrap();
        wait_for_status(&controller, LifecycleStatus::Bound).await;

        let dispatch = Dispatch::new(
            "App1__comp1",
            ControlEvent::new(Status::new(ComponentState::Stopped, "shutting down")),
        );
        setup.supervisor.on_status(&dispatch).unwrap();
        assert_eq!(controller.status(), LifecycleStatus::Unbound);
    }

    #[tokio::test]
    async fn test_stopped_reply_is_left_to_the_controller() {
        let setup = setup().await;
        let controller = supervise(&setup, "comp1");
        controller.launch().await.unwrap();
        wait_for_status(&controller, LifecycleStatus::Bound).await;

        let request = ControlEvent::new(Status::default());
        let reply = ControlEvent::reply_to(
            &request,
            Status::new(ComponentState::Stopped, "stopped on request"),
        );
        setup
            .supervisor
            .on_status(&Dispatch::new("App1__comp1", reply))
            .unwrap();
        assert_eq!(controller.status(), LifecycleStatus::Bound);
        controller.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_skips_inactive() {
        let setup = setup().await;
        let first = supervise(&setup, "comp1");
        let second = supervise(&setup, "comp2");
        first.launch().await.unwrap();
        wait_for_status(&first, LifecycleStatus::Bound).await;

        let results = setup.supervisor.stop_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "App1__comp1");
        assert!(results[0].1.is_ok());
        assert_eq!(first.status(), LifecycleStatus::Unbound);
        assert_eq!(second.status(), LifecycleStatus::Created);
    }

    #[tokio::test]
    async fn test_register_twice_and_detach() {
        let setup = setup().await;
        let controller = supervise(&setup, "comp1");
        assert!(setup.supervisor.register(controller).is_err());
        assert_eq!(setup.supervisor.len(), 1);
        assert_eq!(setup.supervisor.snapshots()[0].instance_id, "App1__comp1");

        setup.supervisor.detach();
        assert!(setup.supervisor.remove("App1__comp1").is_some());
        assert!(setup.supervisor.is_empty());
    }
}
