use clap::{Parser, ValueEnum};
use fleetsim_apiserver::{ApiServer, AppState, Config as ApiConfig};
use fleetsim_runtime::{
    rehydrate, Components, ControllerConfig, CredentialBootstrapper, CredentialConfig,
    DeletionWatcher, DeletionWatcherConfig, KwokConfig, KwokControlPlane, Orchestrator,
    OrchestratorConfig, ProxyConfig, ProxySupervisor, RancherClient, TemplateConfig,
    TenantProvisioner,
};
use fleetsim_state::{FileStateStore, SnapshotStore};
use fleetsim_tunnel::{TunnelConfig, TunnelManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "fleetsim",
    about = "Simulated downstream cluster fleet for a Rancher-style controller"
)]
struct Cli {
    /// Address of the control API
    #[arg(long, env = "FLEETSIM_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Path of the fleet state file
    #[arg(long, env = "FLEETSIM_STATE_FILE", default_value = "./fleetsim-state.json")]
    state_file: PathBuf,

    /// Base URL of the controller
    #[arg(long, env = "FLEETSIM_CONTROLLER_URL")]
    controller_url: String,

    /// Operator API token for the controller
    #[arg(long, env = "FLEETSIM_CONTROLLER_TOKEN", hide_env_values = true)]
    controller_token: String,

    /// Skip TLS verification against the controller
    #[arg(long, env = "FLEETSIM_INSECURE")]
    insecure: bool,

    /// First port handed to per-cluster proxies
    #[arg(long, env = "FLEETSIM_BASE_PORT", default_value_t = 8440)]
    base_port: u16,

    /// Name of the shared kwok cluster
    #[arg(long, env = "FLEETSIM_KWOK_CLUSTER", default_value = "fleetsim")]
    kwok_cluster: String,

    /// Port the shared kube-apiserver is published on
    #[arg(long, env = "FLEETSIM_KWOK_API_PORT", default_value_t = 6443)]
    kwok_api_port: u16,

    #[arg(long, env = "FLEETSIM_KWOKCTL", default_value = "kwokctl")]
    kwokctl: String,

    #[arg(long, env = "FLEETSIM_KUBECTL", default_value = "kubectl")]
    kubectl: String,

    /// Simulated nodes per cluster
    #[arg(long, env = "FLEETSIM_NODES", default_value_t = 3)]
    nodes_per_cluster: usize,

    /// Simulated pods per node
    #[arg(long, env = "FLEETSIM_PODS_PER_NODE", default_value_t = 2)]
    pods_per_node: usize,

    /// Credential secret polls before giving up
    #[arg(long, env = "FLEETSIM_CREDENTIAL_POLLS", default_value_t = 30)]
    credential_polls: u32,

    /// Seconds between credential secret polls
    #[arg(long, env = "FLEETSIM_CREDENTIAL_POLL_INTERVAL", default_value_t = 2)]
    credential_poll_interval: u64,

    /// Minimum seconds between two dials of the same session
    #[arg(long, env = "FLEETSIM_RECONNECT_INTERVAL", default_value_t = 5)]
    reconnect_interval: u64,

    /// Seconds between tunnel keepalive pings
    #[arg(long, env = "FLEETSIM_KEEPALIVE_INTERVAL", default_value_t = 10)]
    keepalive_interval: u64,

    /// Seconds between polls for clusters deleted on the controller
    #[arg(long, env = "FLEETSIM_WATCH_INTERVAL", default_value_t = 30)]
    watch_interval: u64,

    /// Seconds a single controller listing may take during a watch poll
    #[arg(long, env = "FLEETSIM_WATCH_TIMEOUT", default_value_t = 30)]
    watch_timeout: u64,

    #[arg(long, env = "FLEETSIM_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A TLS crypto provider was already installed");
    }

    run(cli).await
}

async fn run(cli: Cli) -> miette::Result<()> {
    info!("Starting fleetsim against controller {}", cli.controller_url);

    let store = Arc::new(
        FileStateStore::new(&cli.state_file)
            .map_err(|e| miette::miette!("Failed to open state file: {}", e))?,
    );
    // A corrupt snapshot stops startup here, as a diagnostic
    let persisted = store.load().map_err(miette::Report::new)?;
    info!(
        clusters = persisted.clusters.len(),
        "Loaded fleet snapshot from {}",
        cli.state_file.display()
    );

    let token = CancellationToken::new();

    let control_plane = Arc::new(
        KwokControlPlane::new(KwokConfig {
            cluster_name: cli.kwok_cluster.clone(),
            api_port: cli.kwok_api_port,
            kwokctl: cli.kwokctl.clone(),
            kubectl: cli.kubectl.clone(),
            ..KwokConfig::default()
        })
        .map_err(miette::Report::new)?,
    );
    let api_url = fleetsim_runtime::ControlPlane::api_url(control_plane.as_ref());

    let controller = Arc::new(
        RancherClient::new(&ControllerConfig {
            url: cli.controller_url.clone(),
            token: cli.controller_token.clone(),
            insecure: cli.insecure,
            ..ControllerConfig::default()
        })
        .map_err(miette::Report::new)?,
    );

    let tunnels = Arc::new(TunnelManager::new(
        TunnelConfig {
            min_reconnect_interval: Duration::from_secs(cli.reconnect_interval),
            keepalive_interval: Duration::from_secs(cli.keepalive_interval),
            ..TunnelConfig::for_controller(&cli.controller_url)
        },
        token.clone(),
    ));

    let proxies = Arc::new(
        ProxySupervisor::new(
            ProxyConfig {
                base_port: cli.base_port,
                ..ProxyConfig::default()
            },
            &api_url,
            persisted.proxy_ports,
            token.clone(),
        )
        .map_err(miette::Report::new)?,
    );

    let credentials = CredentialBootstrapper::new(
        controller.clone(),
        control_plane.clone(),
        CredentialConfig {
            poll_attempts: cli.credential_polls,
            poll_interval: Duration::from_secs(cli.credential_poll_interval),
            ..CredentialConfig::default()
        },
    );

    let provisioner = TenantProvisioner::new(
        control_plane,
        TemplateConfig {
            nodes_per_cluster: cli.nodes_per_cluster,
            pods_per_node: cli.pods_per_node,
            ..TemplateConfig::default()
        },
        Duration::from_secs(120),
    );

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            health_address: cli.listen.to_string(),
            ..OrchestratorConfig::default()
        },
        Components {
            store,
            provisioner,
            proxies,
            credentials,
            controller: controller.clone(),
            tunnels,
        },
        persisted.clusters,
        token.clone(),
    );

    // 1. Pick up where the previous process left off
    match rehydrate(&orchestrator).await {
        Ok(report) => info!(
            resumed = report.resumed.len(),
            torn_down = report.torn_down.len(),
            "Rehydrated persisted clusters"
        ),
        Err(e) => error!("Rehydration incomplete: {}", e),
    }

    // 2. Spawn deletion watcher
    let watcher = DeletionWatcher::new(
        orchestrator.clone(),
        controller,
        DeletionWatcherConfig {
            interval: Duration::from_secs(cli.watch_interval),
            call_timeout: Duration::from_secs(cli.watch_timeout),
        },
    );
    let watcher_handle = tokio::spawn(watcher.run(token.clone()));

    // 3. Spawn control API
    let api_server = ApiServer::new(
        ApiConfig {
            listen_addr: cli.listen,
        },
        Arc::new(AppState::new(orchestrator.clone())),
    );
    let api_token = token.clone();
    let mut api_handle = tokio::spawn(async move { api_server.run(api_token).await });

    info!("All components started. Control API on {}", cli.listen);

    // Wait for shutdown signal, or for the control API to die
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;
        }
        result = &mut api_handle => {
            token.cancel();
            let _ = orchestrator.shutdown().await;
            return match result {
                Ok(Ok(())) => Err(miette::miette!("Control API stopped unexpectedly")),
                Ok(Err(e)) => Err(miette::miette!(
                    code = "fleetsim::api_bind",
                    help = format!("Is another process already listening on {}?", cli.listen),
                    "Control API failed: {}",
                    e
                )),
                Err(e) => Err(miette::miette!("Control API task failed: {}", e)),
            };
        }
    }

    info!("Shutting down gracefully...");
    token.cancel();

    // Wait for all tasks to finish with a timeout
    let shutdown_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(api_handle, watcher_handle);
    })
    .await;

    if let Err(e) = orchestrator.shutdown().await {
        error!("Failed to persist final snapshot: {}", e);
    }

    info!("Shutdown complete");

    Ok(())
}
