// tests/control_plane.rs

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use esb_ccp::ccp::{CcpManager, Data, DataRequest, DataType, Dispatch, EventBody, EventType, LogLevel};
use esb_ccp::config::{AppConfig, ConfigManager};
use esb_ccp::lifecycle::{
    AuditCategory, ComponentController, InProcessLauncher, LaunchConfiguration, LaunchMechanism,
    LifecycleStatus, LifecycleSupervisor, MemoryAuditSink,
};
use esb_ccp::manager::Manager;
use esb_ccp::transport::{InMemoryTransport, Transport};
use esb_ccp::{Result, ServiceInstanceId};

struct ControlPlane {
    config: AppConfig,
    transport: Arc<dyn Transport>,
    ccp: Arc<CcpManager>,
    supervisor: Arc<LifecycleSupervisor>,
    audit: MemoryAuditSink,
}

impl ControlPlane {
    async fn start(config: AppConfig) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
        let mut ccp = CcpManager::new(config.ccp.clone(), Arc::clone(&transport));
        ccp.initialize().await.unwrap();
        let ccp = Arc::new(ccp);
        let supervisor = LifecycleSupervisor::attach(Arc::clone(&ccp));
        Self {
            config,
            transport,
            ccp,
            supervisor,
            audit: MemoryAuditSink::new(),
        }
    }

    async fn launch(&self, name: &str) -> Arc<ComponentController> {
        let launch = LaunchConfiguration::new(ServiceInstanceId::new("App1", name));
        let mechanism = LaunchMechanism::InProcess(InProcessLauncher::new(
            self.config.ccp.clone(),
            Arc::clone(&self.transport),
        ));
        let controller = Arc::new(ComponentController::new(
            launch,
            mechanism,
            Arc::clone(&self.ccp),
            Arc::new(self.audit.clone()),
            &self.config.lifecycle,
        ));
        self.supervisor.register(Arc::clone(&controller)).unwrap();
        controller.launch().await.unwrap();
        controller
    }

    async fn wait_until_bound(&self) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self
                .supervisor
                .snapshots()
                .iter()
                .any(|snapshot| snapshot.status != LifecycleStatus::Bound)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn scatter_gather_across_supervised_components() {
    let plane = ControlPlane::start(AppConfig::default()).await;
    let names = ["comp1", "comp2", "comp3"];
    for name in names {
        plane.launch(name).await;
    }
    plane.wait_until_bound().await;

    let observed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&observed);
    plane.ccp.subscribe(
        EventType::Data,
        "observer",
        Arc::new(move |_: &Dispatch| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let targets: Vec<String> = names.iter().map(|name| format!("App1__{}", name)).collect();
    let request = plane.ccp.new_event(DataRequest::new([DataType::ProcessId]));
    let mut replies = plane
        .ccp
        .request(request, &targets, Duration::from_secs(2))
        .await
        .unwrap();
    replies.sort_by(|a, b| a.source.cmp(&b.source));

    let sources: Vec<&str> = replies.iter().map(|reply| reply.source.as_str()).collect();
    assert_eq!(sources, vec!["App1__comp1", "App1__comp2", "App1__comp3"]);
    for reply in &replies {
        let EventBody::Data(data) = &reply.event.body else {
            panic!("unexpected reply {:?}", reply.event.body);
        };
        assert!(matches!(data.get(DataType::ProcessId), Some(Data::ProcessId(_))));
    }
    assert_eq!(observed.load(Ordering::SeqCst), 3);
    assert_eq!(plane.ccp.pending_requests(), 0);
    assert!(plane.ccp.stats().replies_matched >= 3);
}

#[tokio::test]
async fn full_lifecycle_leaves_an_audit_trail() {
    let plane = ControlPlane::start(AppConfig::default()).await;
    let controller = plane.launch("comp1").await;
    plane.wait_until_bound().await;

    let mut levels = BTreeMap::new();
    levels.insert("bus.routing".to_string(), LogLevel::Trace);
    controller.set_log_level(&levels).await.unwrap();
    assert_eq!(
        controller.get_log_levels(&["bus.routing".to_string()]).await.unwrap(),
        levels
    );

    controller.stop().await.unwrap();
    controller.launch().await.unwrap();
    plane.wait_until_bound().await;
    controller
        .stop_by_policy("license limit reached", AuditCategory::Warning)
        .await
        .unwrap();

    assert_eq!(
        plane.audit.statuses(),
        vec![
            LifecycleStatus::Bounding,
            LifecycleStatus::Bound,
            LifecycleStatus::Unbound,
            LifecycleStatus::Bounding,
            LifecycleStatus::Bound,
            LifecycleStatus::UnboundByPolicy,
        ]
    );
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.status, LifecycleStatus::UnboundByPolicy);
    assert!(snapshot.last_kill >= snapshot.last_launch);
}

#[tokio::test]
async fn configured_destinations_carry_the_traffic() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "ccp:\n  outbound_destination: test.out\n  inbound_destination: test.in\n  default_priority: 7"
    )
    .unwrap();

    let mut manager = ConfigManager::with_config_file(file.path()).unwrap();
    manager.initialize().await.unwrap();
    let config = manager.get_config().await.unwrap();
    assert_eq!(config.ccp.outbound_destination, "test.out");

    let plane = ControlPlane::start(config).await;
    plane.launch("comp1").await;
    plane.wait_until_bound().await;

    let request = plane.ccp.new_event(DataRequest::new([DataType::ComponentStats]));
    assert_eq!(request.header.priority, 7);
    let replies = plane
        .ccp
        .request(request, &["App1__comp1"], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
}
