use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarmgate::config::{Config, OrchestratorConfig};
use swarmgate::credential::RegistryCredential;
use swarmgate::docker::SwarmOrchestrator;
use swarmgate::error::GatewayError;
use swarmgate::metrics::GatewayMetrics;
use swarmgate::orchestrator::{Orchestrator, SharedOrchestrator};
use swarmgate::server::{GatewayServer, GatewayState, PKG_NAME, VERSION};
use swarmgate::watcher::ReplicaWatcher;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("swarmgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let credential = RegistryCredential::from_env()?;
    if !credential.is_empty() {
        info!("Private registry credential loaded from environment");
    }

    // Nothing can be served without the orchestrator
    let orchestrator = match connect_orchestrator(&config.orchestrator).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "Cannot reach orchestrator, exiting");
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(GatewayMetrics::new());

    let watcher = Arc::new(ReplicaWatcher::new(
        Arc::clone(&orchestrator),
        Arc::clone(&metrics),
        config.orchestrator.function_label.clone(),
        config.watcher.interval(),
    ));
    match watcher.tick().await {
        Ok(count) => info!(functions = count, "Initial replica snapshot loaded"),
        Err(e) => warn!(error = %e, "Initial replica snapshot failed, starting empty"),
    }
    let watcher_handle = tokio::spawn(Arc::clone(&watcher).run(shutdown_rx.clone()));

    let state = Arc::new(GatewayState::new(
        &config,
        orchestrator,
        metrics,
        watcher.reader(),
        credential,
    ));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}:{}': {}", config.server.bind, config.server.port, e))?;

    let server = GatewayServer::new(bind_addr, state, shutdown_rx.clone(), config.server.read_timeout());
    let listener = server.bind().await.map_err(|e| {
        error!(error = %e, "Cannot start gateway server, exiting");
        e
    })?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = watcher_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn connect_orchestrator(config: &OrchestratorConfig) -> Result<SharedOrchestrator, GatewayError> {
    let swarm = SwarmOrchestrator::connect(config)
        .map_err(|e| GatewayError::OrchestratorUnavailable(e.to_string()))?;
    let version = swarm
        .ping()
        .await
        .map_err(|e| GatewayError::OrchestratorUnavailable(e.to_string()))?;

    info!(version = %version, "Connected to orchestrator");
    Ok(Arc::new(swarm))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the gateway");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        read_timeout_secs = config.server.read_timeout_secs,
        write_timeout_secs = config.server.write_timeout_secs,
        management_auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        docker_host = ?config.orchestrator.docker_host,
        timeout_secs = config.orchestrator.timeout_secs,
        function_label = %config.orchestrator.function_label,
        network = ?config.orchestrator.network,
        function_port = config.orchestrator.function_port,
        "Orchestrator settings"
    );
    info!(
        interval_secs = config.watcher.interval_secs,
        freshness_secs = config.watcher.freshness().as_secs(),
        "Replica watcher settings"
    );
    info!(
        scale_step = config.scaling.scale_step,
        min_replicas = config.scaling.min_replicas,
        max_replicas = config.scaling.max_replicas,
        "Alert scaling settings"
    );
}
