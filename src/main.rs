// src/main.rs - ccpctl operator entry point

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use esb_ccp::ccp::{CcpManager, DataRequest, DataType};
use esb_ccp::config::{AppConfig, ConfigManager};
use esb_ccp::error::Result;
use esb_ccp::lifecycle::{
    AuditSink, ComponentController, InProcessLauncher, LaunchConfiguration, LaunchMechanism,
    LifecycleStatus, LifecycleSupervisor, TracingAuditSink,
};
use esb_ccp::logging::LoggingManager;
use esb_ccp::manager::{HealthStatus, Manager};
use esb_ccp::transport::{InMemoryTransport, Transport};
use esb_ccp::types::ServiceInstanceId;
use esb_ccp::utils::async_utils::with_timeout;
use esb_ccp::utils::timing::duration_to_human;

#[derive(Parser)]
#[command(
    name = "ccpctl",
    version = esb_ccp::VERSION,
    about = "Drives the Component Control Protocol against simulated components",
    long_about = None
)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch, query and stop in-process components, then print their snapshots
    Demo {
        #[arg(short = 'n', long, default_value_t = 2)]
        components: usize,

        #[arg(long, default_value = "App1")]
        application: String,
    },
    /// Initialize every manager and report its health
    Health,
    /// Validate configuration
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Demo {
            components,
            application,
        }) => run_demo(&cli, *components, application).await,
        Some(Commands::Health) => check_health(&cli).await,
        Some(Commands::ValidateConfig) => validate_config(&cli).await,
        None => run_demo(&cli, 2, "App1").await,
    }
}

async fn load_config(cli: &Cli) -> Result<(ConfigManager, AppConfig)> {
    let mut manager = match &cli.config {
        Some(path) => ConfigManager::with_config_file(path)?,
        None => ConfigManager::new(),
    };
    manager.initialize().await?;
    let mut config = manager.get_config().await?;
    if cli.debug {
        config.logging.level = "debug".to_string();
    }
    Ok((manager, config))
}

async fn run_demo(cli: &Cli, components: usize, application: &str) -> Result<()> {
    let started = Instant::now();
    let (mut config_manager, config) = load_config(cli).await?;
    let mut logging = LoggingManager::new(config.logging.clone());
    logging.initialize().await?;

    tracing::info!("Starting ccpctl v{}", esb_ccp::VERSION);

    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
    let mut ccp = CcpManager::new(config.ccp.clone(), Arc::clone(&transport));
    ccp.initialize().await?;
    let ccp = Arc::new(ccp);

    let supervisor = LifecycleSupervisor::attach(Arc::clone(&ccp));
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink::new());

    let mut targets = Vec::with_capacity(components);
    for index in 1..=components {
        let instance = ServiceInstanceId::new(application, format!("comp{}", index));
        targets.push(instance.to_string());
        let launch = LaunchConfiguration::new(instance).with_version(esb_ccp::VERSION);
        let mechanism = LaunchMechanism::InProcess(InProcessLauncher::new(
            config.ccp.clone(),
            Arc::clone(&transport),
        ));
        let controller = Arc::new(ComponentController::new(
            launch,
            mechanism,
            Arc::clone(&ccp),
            Arc::clone(&audit),
            &config.lifecycle,
        ));
        supervisor.register(Arc::clone(&controller))?;
        controller.launch().await?;
    }

    let bind_timeout = Duration::from_millis(config.lifecycle.request_timeout_ms);
    with_timeout(
        async {
            while supervisor
                .snapshots()
                .iter()
                .any(|snapshot| snapshot.status != LifecycleStatus::Bound)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        },
        bind_timeout,
    )
    .await?;
    println!("{} components bound", supervisor.len());

    let request = ccp.new_event(DataRequest::new([DataType::ProcessId, DataType::ComponentStats]));
    let replies = ccp.request_default(request, &targets).await?;
    for reply in &replies {
        println!("{} -> {}", reply.source, serde_json::to_string(&reply.event.body)?);
    }

    if let Some(first) = targets.first().and_then(|target| supervisor.get(target)) {
        let mut levels = std::collections::BTreeMap::new();
        levels.insert("bus.core".to_string(), esb_ccp::ccp::LogLevel::Debug);
        first.set_log_level(&levels).await?;
        let read = first.get_log_levels(&[]).await?;
        println!("{} log levels: {}", first.instance_id(), serde_json::to_string(&read)?);
    }

    for (instance, result) in supervisor.stop_all().await {
        if let Err(e) = result {
            tracing::error!("Failed to stop '{}': {}", instance, e);
        }
    }

    println!("{}", serde_json::to_string_pretty(&supervisor.snapshots())?);
    println!("{}", serde_json::to_string_pretty(&ccp.stats())?);
    println!("Session took {}", duration_to_human(started.elapsed()));

    supervisor.detach();
    ccp.stop().await?;
    logging.shutdown().await?;
    config_manager.shutdown().await?;
    Ok(())
}

async fn check_health(cli: &Cli) -> Result<()> {
    let (mut config_manager, config) = load_config(cli).await?;
    let mut logging = LoggingManager::new(config.logging.clone());
    logging.initialize().await?;

    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
    let mut ccp = CcpManager::new(config.ccp.clone(), transport);
    ccp.initialize().await?;

    println!("ccpctl Health");
    println!("=============");

    let managers: [&dyn Manager; 3] = [&config_manager, &logging, &ccp];
    let mut overall = HealthStatus::Healthy;
    for manager in managers {
        let status = manager.health_check().await;
        let status_icon = match status {
            HealthStatus::Healthy => "✅",
            HealthStatus::Degraded => "⚠️",
            HealthStatus::Unhealthy => "❌",
            HealthStatus::Unknown => "❓",
        };
        println!("  {} {}: {}", status_icon, manager.name(), status);
        if status != HealthStatus::Healthy {
            overall = status;
        }
    }

    let exit_code = match overall {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
        HealthStatus::Unknown => 3,
    };

    ccp.shutdown().await?;
    logging.shutdown().await?;
    config_manager.shutdown().await?;

    if exit_code != 0 {
        process::exit(exit_code);
    }
    Ok(())
}

async fn validate_config(cli: &Cli) -> Result<()> {
    println!("Validating configuration...");

    let mut manager = match &cli.config {
        Some(path) => ConfigManager::with_config_file(path)?,
        None => ConfigManager::new(),
    };

    match manager.initialize().await {
        Ok(()) => {
            let config = manager.get_config().await?;
            println!("✅ Configuration is valid");
            println!("   Application: {}", config.app.name);
            println!("   Outbound: {}", config.ccp.outbound_destination);
            println!("   Inbound: {}", config.ccp.inbound_destination);
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e.message);
            if let esb_ccp::ErrorKind::Configuration {
                validation_errors, ..
            } = &e.kind
            {
                for error in validation_errors {
                    println!("   - {}", error);
                }
            }
            process::exit(1);
        }
    }
}
