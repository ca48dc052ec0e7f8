//! In-process fleet wiring shared by the lifecycle tests

use crate::control_plane::ControlPlane;
use crate::credential::{CredentialBootstrapper, CredentialConfig};
use crate::mock::{MockControlPlane, MockController};
use crate::orchestrator::{Components, Orchestrator, OrchestratorConfig};
use crate::provisioner::TenantProvisioner;
use crate::proxy::{ProxyConfig, ProxySupervisor};
use crate::templates::TemplateConfig;
use fleetsim_core::{ClusterStatus, LogicalCluster, PersistedState};
use fleetsim_state::{FileStateStore, SnapshotStore};
use fleetsim_tunnel::{TunnelConfig, TunnelManager};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub(crate) struct Fleet {
    pub orchestrator: Arc<Orchestrator>,
    pub plane: MockControlPlane,
    pub controller: MockController,
    pub store: Arc<FileStateStore>,
    pub base_port: u16,
    controller_url: String,
    poll_attempts: u32,
    dir: Arc<TempDir>,
}

async fn free_base() -> u16 {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().port().min(u16::MAX - 100)
}

impl Fleet {
    pub async fn start() -> Self {
        Self::start_with(MockControlPlane::new(), 20).await
    }

    pub async fn start_with(plane: MockControlPlane, poll_attempts: u32) -> Self {
        let controller = MockController::new();
        let controller_url = controller.serve_tunnels().await.unwrap();
        let dir = Arc::new(tempfile::tempdir().unwrap());
        Self::build(plane, controller, controller_url, dir, free_base().await, poll_attempts)
    }

    /// Shut this process down and start a new one over the same state file
    /// and external world
    pub async fn restart(self) -> Self {
        self.restart_edited(|_| {}).await
    }

    /// Like `restart`, editing the state file while the process is down
    pub async fn restart_edited(self, edit: impl FnOnce(&mut PersistedState)) -> Self {
        self.orchestrator.shutdown().await.unwrap();
        let mut state = self.store.load().unwrap();
        edit(&mut state);
        self.store.save(&state).unwrap();
        Self::build(
            self.plane,
            self.controller,
            self.controller_url,
            self.dir,
            self.base_port,
            self.poll_attempts,
        )
    }

    fn build(
        plane: MockControlPlane,
        controller: MockController,
        controller_url: String,
        dir: Arc<TempDir>,
        base_port: u16,
        poll_attempts: u32,
    ) -> Self {
        let store = Arc::new(FileStateStore::new(dir.path().join("state.json")).unwrap());
        let persisted = store.load().unwrap();
        let token = CancellationToken::new();

        let tunnels = Arc::new(TunnelManager::new(
            TunnelConfig {
                min_reconnect_interval: Duration::from_millis(50),
                backoff_max: Duration::from_millis(200),
                handshake_timeout: Duration::from_secs(2),
                ..TunnelConfig::for_controller(&controller_url)
            },
            token.clone(),
        ));
        let proxies = Arc::new(
            ProxySupervisor::new(
                ProxyConfig {
                    base_port,
                    retry_delay: Duration::from_millis(20),
                    drain_timeout: Duration::from_secs(1),
                    ..ProxyConfig::default()
                },
                &plane.api_url(),
                persisted.proxy_ports,
                token.clone(),
            )
            .unwrap(),
        );
        let credentials = CredentialBootstrapper::new(
            Arc::new(controller.clone()),
            Arc::new(plane.clone()),
            CredentialConfig {
                poll_attempts,
                poll_interval: Duration::from_millis(10),
                ..CredentialConfig::default()
            },
        );
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                stage_attempts: 2,
                stage_retry_delay: Duration::from_millis(20),
                connect_timeout: Duration::from_secs(5),
                max_rebootstrap_attempts: 2,
                ..OrchestratorConfig::default()
            },
            Components {
                store: store.clone(),
                provisioner: TenantProvisioner::new(
                    Arc::new(plane.clone()),
                    TemplateConfig::default(),
                    Duration::from_secs(5),
                ),
                proxies,
                credentials,
                controller: Arc::new(controller.clone()),
                tunnels,
            },
            persisted.clusters,
            token,
        );

        Self {
            orchestrator,
            plane,
            controller,
            store,
            base_port,
            controller_url,
            poll_attempts,
            dir,
        }
    }

    /// Poll until `name` has status `want`
    pub async fn wait_status(&self, name: &str, want: ClusterStatus) -> LogicalCluster {
        for _ in 0..200 {
            if let Ok(detail) = self.orchestrator.get_cluster(name) {
                if detail.cluster.status == want {
                    return detail.cluster;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "{} never reached {}: {:?}",
            name,
            want,
            self.orchestrator.get_cluster(name).map(|d| d.cluster)
        );
    }

    /// Create `name` and wait until its pipeline has settled on Ready
    pub async fn ready(&self, name: &str) -> LogicalCluster {
        self.orchestrator.create_cluster(name).await.unwrap();
        let cluster = self.wait_status(name, ClusterStatus::Ready).await;
        self.orchestrator.wait_idle(name).await;
        cluster
    }

    pub fn persisted(&self) -> PersistedState {
        self.store.load().unwrap()
    }
}
