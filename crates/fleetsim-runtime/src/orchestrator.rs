//! Per-cluster lifecycle state machine
//!
//! Each cluster runs through the stages of [`Stage`] in order. Every stage
//! entry and exit is persisted, a cluster never has two pipelines at once,
//! and a Ready cluster keeps a background task that re-bootstraps its
//! credential when the controller starts rejecting it.

use crate::command::bounded;
use crate::controller_client::ControllerApi;
use crate::credential::{steve_credential, CredentialBootstrapper};
use crate::error::{Result, RuntimeError};
use crate::provisioner::TenantProvisioner;
use crate::proxy::ProxySupervisor;
use fleetsim_core::{
    tenant_namespace, validate_cluster_name, ClusterStatus, ClusterSummary, LogicalCluster,
    PersistedState, Stage, TunnelKind,
};
use fleetsim_state::SnapshotStore;
use fleetsim_tunnel::{DialPolicy, SessionState, TunnelManager};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Runs of a stage on transient errors before the cluster fails
    pub stage_attempts: u32,
    pub stage_retry_delay: Duration,
    /// How long both sessions get to complete their first handshake
    pub connect_timeout: Duration,
    /// Re-bootstraps after rejected credentials before the cluster fails
    pub max_rebootstrap_attempts: u32,
    /// Health endpoint steve-proxy sessions may dial besides the proxy
    pub health_address: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stage_attempts: 3,
            stage_retry_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(60),
            max_rebootstrap_attempts: 3,
            health_address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// The collaborators a pipeline drives
pub struct Components {
    pub store: Arc<dyn SnapshotStore>,
    pub provisioner: TenantProvisioner,
    pub proxies: Arc<ProxySupervisor>,
    pub credentials: CredentialBootstrapper,
    pub controller: Arc<dyn ControllerApi>,
    pub tunnels: Arc<TunnelManager>,
}

/// One cluster with its proxy port and live session states
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetail {
    #[serde(flatten)]
    pub cluster: LogicalCluster,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    pub sessions: Vec<SessionState>,
}

/// Marks a cluster as having a pipeline in flight until dropped
pub struct PipelineGuard {
    in_flight: watch::Sender<HashSet<String>>,
    name: String,
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|set| {
            set.remove(&self.name);
        });
    }
}

/// Cluster Lifecycle Orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn SnapshotStore>,
    provisioner: TenantProvisioner,
    proxies: Arc<ProxySupervisor>,
    credentials: CredentialBootstrapper,
    controller: Arc<dyn ControllerApi>,
    tunnels: Arc<TunnelManager>,

    clusters: RwLock<BTreeMap<String, LogicalCluster>>,
    in_flight: watch::Sender<HashSet<String>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    /// Latest cluster-agent credential per cluster, never persisted
    credential_cache: Mutex<HashMap<String, String>>,
    rebootstraps: Mutex<HashMap<String, u32>>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
    persist_lock: tokio::sync::Mutex<()>,
    token: CancellationToken,
}

impl Orchestrator {
    /// Build the orchestrator over the clusters of the loaded snapshot.
    ///
    /// Nothing is resumed here; that is the rehydration coordinator's job.
    pub fn new(
        config: OrchestratorConfig,
        components: Components,
        clusters: BTreeMap<String, LogicalCluster>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (in_flight, _) = watch::channel(HashSet::new());
        let orchestrator = Arc::new(Self {
            config,
            store: components.store,
            provisioner: components.provisioner,
            proxies: components.proxies,
            credentials: components.credentials,
            controller: components.controller,
            tunnels: components.tunnels,
            clusters: RwLock::new(clusters),
            in_flight,
            tokens: Mutex::new(HashMap::new()),
            credential_cache: Mutex::new(HashMap::new()),
            rebootstraps: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            token,
        });
        spawn_port_persistence(Arc::downgrade(&orchestrator), orchestrator.token.clone());
        orchestrator
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &TenantProvisioner {
        &self.provisioner
    }

    pub fn proxies(&self) -> &Arc<ProxySupervisor> {
        &self.proxies
    }

    pub fn credentials(&self) -> &CredentialBootstrapper {
        &self.credentials
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Register a new cluster and start its pipeline in the background.
    ///
    /// Returns once the cluster is validated and persisted.
    pub async fn create_cluster(self: &Arc<Self>, name: &str) -> Result<LogicalCluster> {
        validate_cluster_name(name)?;

        let cluster = {
            let mut clusters = self.clusters.write();
            if clusters.contains_key(name) {
                return Err(RuntimeError::already_exists(name));
            }
            let cluster = LogicalCluster::new(name);
            clusters.insert(name.to_string(), cluster.clone());
            cluster
        };

        if let Err(e) = self.persist().await {
            self.clusters.write().remove(name);
            return Err(e);
        }

        info!(cluster = name, id = %cluster.id, "Cluster registered");
        self.spawn_pipeline(name, Stage::EnsureControlPlane)?;
        Ok(cluster)
    }

    /// Tear a cluster down: cancel its pipeline and sessions, stop its
    /// proxy, free its port and forget it. Namespace removal is left
    /// running in the background.
    pub async fn delete_cluster(&self, name: &str) -> Result<()> {
        let already_deleting = self.update(name, |cluster| {
            if cluster.status == ClusterStatus::Deleting {
                return Ok(true);
            }
            cluster.transition(ClusterStatus::Deleting)?;
            Ok(false)
        })?;
        if already_deleting {
            debug!(cluster = name, "Deletion already in progress");
            return Ok(());
        }

        info!(cluster = name, "Deleting cluster");
        self.persist_logged().await;
        self.teardown(name).await
    }

    /// Run the pipeline again from `stage`.
    ///
    /// Rejected with `PipelineBusy` while another pipeline for the cluster
    /// is running. A cluster caught mid-deletion finishes its teardown.
    pub async fn resume(self: &Arc<Self>, name: &str, stage: Stage) -> Result<()> {
        let status = self
            .clusters
            .read()
            .get(name)
            .map(|c| c.status)
            .ok_or_else(|| RuntimeError::not_found(name))?;

        match status {
            ClusterStatus::Deleting => self.teardown(name).await,
            s if s.is_terminal() => {
                debug!(cluster = name, status = %s, "Not resuming terminal cluster");
                Ok(())
            }
            _ => {
                info!(cluster = name, stage = %stage, "Resuming pipeline");
                self.spawn_pipeline(name, stage)
            }
        }
    }

    pub fn list_clusters(&self) -> Vec<ClusterSummary> {
        let ports = self.proxies.ports_snapshot();
        self.clusters
            .read()
            .values()
            .map(|c| c.summary(ports.get(&c.name).copied()))
            .collect()
    }

    pub fn get_cluster(&self, name: &str) -> Result<ClusterDetail> {
        let proxy_port = self.proxies.port(name);
        let cluster = self
            .clusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found(name))?;
        Ok(ClusterDetail {
            cluster,
            proxy_port,
            sessions: self.tunnels.states(name),
        })
    }

    /// Every tracked cluster
    pub fn clusters(&self) -> Vec<LogicalCluster> {
        self.clusters.read().values().cloned().collect()
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.in_flight.borrow().contains(name)
    }

    /// Resolve once no pipeline runs for `name`
    pub async fn wait_idle(&self, name: &str) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|set| !set.contains(name)).await;
    }

    /// Current fleet snapshot
    pub fn snapshot(&self) -> PersistedState {
        let proxy_ports = self.proxies.ports_snapshot();
        PersistedState {
            clusters: self.clusters.read().clone(),
            proxy_ports,
            ..PersistedState::default()
        }
    }

    /// Write the current snapshot. Saves are serialized, so the last one to
    /// finish always carries the latest state.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| RuntimeError::internal_error(format!("state save task: {}", e)))??;
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!("Failed to persist fleet state: {}", e);
        }
    }

    /// Stop every session and listener and write a final snapshot
    pub async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        self.tunnels.shutdown();
        self.proxies.shutdown().await;
        self.persist().await?;
        info!("Orchestrator shut down");
        Ok(())
    }

    fn update<T>(&self, name: &str, f: impl FnOnce(&mut LogicalCluster) -> Result<T>) -> Result<T> {
        let mut clusters = self.clusters.write();
        let cluster = clusters
            .get_mut(name)
            .ok_or_else(|| RuntimeError::not_found(name))?;
        f(cluster)
    }

    fn cluster_id(&self, name: &str) -> Option<String> {
        self.clusters
            .read()
            .get(name)
            .and_then(|c| c.cluster_id.clone())
    }

    fn cluster_token(&self, name: &str) -> CancellationToken {
        self.tokens
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| self.token.child_token())
            .clone()
    }

    /// Claim the cluster for one pipeline; `None` if one is already running
    pub fn begin(&self, name: &str) -> Option<PipelineGuard> {
        let claimed = self
            .in_flight
            .send_if_modified(|set| set.insert(name.to_string()));
        claimed.then(|| PipelineGuard {
            in_flight: self.in_flight.clone(),
            name: name.to_string(),
        })
    }

    fn spawn_pipeline(self: &Arc<Self>, name: &str, from: Stage) -> Result<()> {
        let guard = self
            .begin(name)
            .ok_or_else(|| RuntimeError::pipeline_busy(name))?;
        let token = self.cluster_token(name);
        let this = self.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            this.run_pipeline(&name, from, &token).await;
        });
        Ok(())
    }

    async fn run_pipeline(self: &Arc<Self>, name: &str, from: Stage, token: &CancellationToken) {
        for stage in from.remaining() {
            if token.is_cancelled() {
                debug!(cluster = name, "Pipeline cancelled");
                return;
            }
            match self.enter_stage(name, stage) {
                Ok(true) => self.persist_logged().await,
                Ok(false) => {}
                Err(e) => {
                    debug!(cluster = name, stage = %stage, "Pipeline stopped: {}", e);
                    return;
                }
            }

            debug!(cluster = name, stage = %stage, "Running stage");
            match self.run_stage_with_retry(name, stage, token).await {
                Ok(()) => self.persist_logged().await,
                Err(_) if token.is_cancelled() => {
                    debug!(cluster = name, stage = %stage, "Pipeline cancelled");
                    return;
                }
                Err(e) => {
                    self.mark_failed(name, stage, &e).await;
                    return;
                }
            }
        }

        let ready = self.update(name, |cluster| {
            cluster.transition(ClusterStatus::Ready)?;
            cluster.message = None;
            Ok(())
        });
        if ready.is_ok() {
            info!(cluster = name, "Cluster is Ready");
            self.persist_logged().await;
            self.spawn_auth_monitor(name);
        }
    }

    /// Move to the stage's status unless the cluster is already further
    /// along. Returns whether the status changed.
    fn enter_stage(&self, name: &str, stage: Stage) -> Result<bool> {
        self.update(name, |cluster| {
            if cluster.status == ClusterStatus::Deleting || cluster.status.is_terminal() {
                return Err(RuntimeError::cancelled(name));
            }
            let target = stage.status();
            if cluster.status != target && cluster.status.can_transition_to(target) {
                cluster.transition(target)?;
                return Ok(true);
            }
            Ok(false)
        })
    }

    async fn run_stage_with_retry(
        &self,
        name: &str,
        stage: Stage,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = token.cancelled() => Err(RuntimeError::cancelled(name)),
                result = self.run_stage(name, stage, token) => result,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.stage_attempts => {
                    warn!(
                        cluster = name,
                        stage = %stage,
                        attempt,
                        "Stage failed, retrying: {}",
                        e
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(RuntimeError::cancelled(name)),
                        _ = tokio::time::sleep(self.config.stage_retry_delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_stage(&self, name: &str, stage: Stage, token: &CancellationToken) -> Result<()> {
        match stage {
            Stage::EnsureControlPlane => self.provisioner.ensure_control_plane().await,
            Stage::ProvisionTenant => {
                let inventory = self.provisioner.provision(name).await?;
                self.update(name, |cluster| {
                    cluster.inventory = inventory;
                    Ok(())
                })
            }
            Stage::StartProxy => {
                let port = self.proxies.start_proxy(name).await?;
                debug!(cluster = name, port, "Proxy ready");
                Ok(())
            }
            Stage::BootstrapCredential => {
                let cluster_id = self.register(name).await?;
                self.credential_for(name, &cluster_id, token).await?;
                Ok(())
            }
            Stage::Connect => self.connect_sessions(name, token).await,
        }
    }

    /// Controller ID of the cluster, registering it on first use
    async fn register(&self, name: &str) -> Result<String> {
        if let Some(id) = self.cluster_id(name) {
            return Ok(id);
        }
        let id = bounded(
            &format!("register {} with the controller", name),
            self.credentials.config().call_timeout,
            self.controller.register_cluster(name),
        )
        .await?;
        self.update(name, |cluster| {
            cluster.cluster_id = Some(id.clone());
            Ok(())
        })?;
        info!(cluster = name, cluster_id = %id, "Registered with controller");
        self.persist_logged().await;
        Ok(id)
    }

    /// Cached credential, else the one in the tenant namespace, else a
    /// freshly bootstrapped one
    async fn credential_for(
        &self,
        name: &str,
        cluster_id: &str,
        token: &CancellationToken,
    ) -> Result<String> {
        if let Some(credential) = self.credential_cache.lock().get(name).cloned() {
            return Ok(credential);
        }
        let namespace = tenant_namespace(name);
        let credential = match self.credentials.current_token(&namespace).await? {
            Some(existing) => {
                debug!(cluster = name, "Reusing credential from tenant namespace");
                existing
            }
            None => {
                self.credentials
                    .bootstrap(name, cluster_id, &namespace, None, token)
                    .await?
            }
        };
        self.credential_cache
            .lock()
            .insert(name.to_string(), credential.clone());
        Ok(credential)
    }

    /// Open (or reuse) both sessions and wait for their first handshake,
    /// re-bootstrapping when the controller rejects the credential
    async fn connect_sessions(&self, name: &str, token: &CancellationToken) -> Result<()> {
        let cluster_id = self
            .cluster_id(name)
            .ok_or_else(|| RuntimeError::internal_error(format!("{} has no controller ID", name)))?;
        let port = self
            .proxies
            .port(name)
            .ok_or_else(|| RuntimeError::internal_error(format!("{} has no proxy port", name)))?;
        let mut credential = self.credential_for(name, &cluster_id, token).await?;

        loop {
            let handles: Vec<_> = TunnelKind::ALL
                .iter()
                .map(|kind| {
                    let policy = DialPolicy::for_kind(*kind, port, &self.config.health_address);
                    let bearer = match kind {
                        TunnelKind::ClusterAgent => credential.clone(),
                        TunnelKind::SteveProxy => steve_credential(&cluster_id),
                    };
                    self.tunnels.connect(name, *kind, &bearer, policy)
                })
                .collect();

            let results = futures_util::future::join_all(
                handles
                    .iter()
                    .map(|h| h.wait_connected(self.config.connect_timeout)),
            )
            .await;

            let mut agent_rejected = false;
            for (handle, result) in handles.iter().zip(results) {
                match result {
                    Ok(()) => debug!(cluster = name, kind = %handle.kind(), "Session connected"),
                    Err(e) if e.is_auth_rejected() && handle.kind() == TunnelKind::ClusterAgent => {
                        agent_rejected = true
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if !agent_rejected {
                self.rebootstraps.lock().remove(name);
                return Ok(());
            }

            warn!(cluster = name, "Controller rejected tunnel credential, re-bootstrapping");
            credential = self.rebootstrap(name, token).await?;
        }
    }

    /// Replace a rejected credential, bounded by `max_rebootstrap_attempts`
    async fn rebootstrap(&self, name: &str, token: &CancellationToken) -> Result<String> {
        let attempts = {
            let mut counts = self.rebootstraps.lock();
            let count = counts.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if attempts > self.config.max_rebootstrap_attempts {
            return Err(RuntimeError::credential_rejected(
                name,
                self.config.max_rebootstrap_attempts,
            ));
        }

        let cluster_id = self
            .cluster_id(name)
            .ok_or_else(|| RuntimeError::internal_error(format!("{} has no controller ID", name)))?;
        let previous = self.credential_cache.lock().get(name).cloned();
        let credential = self
            .credentials
            .bootstrap(
                name,
                &cluster_id,
                &tenant_namespace(name),
                previous.as_deref(),
                token,
            )
            .await?;

        self.credential_cache
            .lock()
            .insert(name.to_string(), credential.clone());
        self.tunnels
            .update_credential(name, TunnelKind::ClusterAgent, &credential);
        info!(cluster = name, attempt = attempts, "Credential re-bootstrapped");
        Ok(credential)
    }

    fn spawn_auth_monitor(self: &Arc<Self>, name: &str) {
        let token = self.cluster_token(name);
        let mut monitors = self.monitors.lock();
        if monitors
            .get(name)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
        {
            return;
        }
        let this = self.clone();
        let cluster = name.to_string();
        monitors.insert(
            name.to_string(),
            tokio::spawn(async move { this.watch_auth(&cluster, &token).await }),
        );
    }

    /// Re-bootstrap whenever the Ready cluster's agent session is rejected
    async fn watch_auth(&self, name: &str, token: &CancellationToken) {
        loop {
            let session = match self.tunnels.session(name, TunnelKind::ClusterAgent) {
                Some(session) if session.is_live() => session,
                _ => return,
            };
            let rejected = tokio::select! {
                _ = token.cancelled() => return,
                rejected = session.rejected() => rejected,
            };
            if !rejected {
                // Stopped or replaced; look again
                continue;
            }

            let _guard = match self.begin(name) {
                Some(guard) => guard,
                None => {
                    // A pipeline owns the cluster and handles the rejection
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(self.config.stage_retry_delay) => continue,
                    }
                }
            };

            warn!(cluster = name, "Controller rejected tunnel credential, re-bootstrapping");
            match self.rebootstrap(name, token).await {
                Ok(_) => {}
                Err(_) if token.is_cancelled() => return,
                Err(e) if e.is_transient() => {
                    warn!(cluster = name, "Re-bootstrap failed, retrying: {}", e);
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(self.config.stage_retry_delay) => continue,
                    }
                }
                Err(e) => {
                    self.mark_failed(name, Stage::Connect, &e).await;
                    return;
                }
            }

            match session.wait_connected(self.config.connect_timeout).await {
                Ok(()) => {
                    self.rebootstraps.lock().remove(name);
                    info!(cluster = name, "Session reconnected with new credential");
                }
                Err(e) => debug!(cluster = name, "Session not back yet: {}", e),
            }
        }
    }

    fn stop_monitor(&self, name: &str) {
        if let Some(monitor) = self.monitors.lock().remove(name) {
            monitor.abort();
        }
    }

    async fn mark_failed(&self, name: &str, stage: Stage, err: &RuntimeError) {
        let failed = self.update(name, |cluster| {
            cluster.fail(stage, err.to_string())?;
            Ok(())
        });
        if failed.is_ok() {
            error!(cluster = name, stage = %stage, "Cluster failed: {}", err);
            self.persist_logged().await;
        }
    }

    async fn teardown(&self, name: &str) -> Result<()> {
        if let Some(token) = self.tokens.lock().remove(name) {
            token.cancel();
        }
        // A monitor mid re-bootstrap holds the pipeline claim
        self.stop_monitor(name);
        self.wait_idle(name).await;
        self.stop_monitor(name);

        self.tunnels.disconnect(name);
        self.proxies.stop_proxy(name).await;
        if let Some(port) = self.proxies.release_port(name) {
            debug!(cluster = name, port, "Released proxy port");
        }
        self.provisioner.deprovision(name);
        self.credential_cache.lock().remove(name);
        self.rebootstraps.lock().remove(name);

        {
            let mut clusters = self.clusters.write();
            if let Some(cluster) = clusters.get_mut(name) {
                if let Err(e) = cluster.transition(ClusterStatus::Deleted) {
                    warn!(cluster = name, "{}", e);
                }
            }
            clusters.remove(name);
        }
        self.persist().await?;
        info!(cluster = name, "Cluster deleted");
        Ok(())
    }
}

/// Save whenever the proxy supervisor moves or frees a port
fn spawn_port_persistence(orchestrator: Weak<Orchestrator>, token: CancellationToken) {
    let mut changes = match orchestrator.upgrade() {
        Some(o) => o.proxies.subscribe(),
        None => return,
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            match orchestrator.upgrade() {
                Some(o) => o.persist_logged().await,
                None => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::ControlPlane;
    use crate::mock::MockControlPlane;
    use crate::testing::Fleet;

    #[tokio::test]
    async fn test_create_reaches_ready() {
        let f = Fleet::start().await;
        let created = f.orchestrator.create_cluster("test-cluster-012").await.unwrap();
        assert_eq!(created.status, ClusterStatus::Creating);
        assert!(!created.id.is_empty());

        let ready = f.wait_status("test-cluster-012", ClusterStatus::Ready).await;
        assert!(ready.cluster_id.is_some());
        assert_eq!(ready.inventory.nodes.len(), 3);
        f.orchestrator.wait_idle("test-cluster-012").await;

        let summaries = f.orchestrator.list_clusters();
        assert_eq!(summaries[0].proxy_port, Some(f.base_port));

        assert_eq!(f.controller.connections("test-cluster-012:cluster-agent"), 1);
        assert_eq!(f.controller.connections("test-cluster-012:steve-proxy"), 1);

        let detail = f.orchestrator.get_cluster("test-cluster-012").unwrap();
        assert_eq!(detail.sessions.len(), 2);

        let persisted = f.persisted();
        assert_eq!(persisted.clusters["test-cluster-012"].status, ClusterStatus::Ready);
        assert_eq!(persisted.proxy_ports["test-cluster-012"], f.base_port);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_names_are_rejected() {
        let f = Fleet::start().await;
        f.orchestrator.create_cluster("alpha").await.unwrap();

        let err = f.orchestrator.create_cluster("alpha").await.unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyExists { .. }));

        let err = f.orchestrator.create_cluster("Not_Valid").await.unwrap_err();
        assert!(matches!(err, RuntimeError::CoreError(_)));
        assert_eq!(f.orchestrator.list_clusters().len(), 1);
    }

    #[tokio::test]
    async fn test_second_cluster_gets_next_port() {
        let f = Fleet::start().await;
        f.ready("alpha").await;
        f.ready("beta").await;

        let ports = f.orchestrator.proxies().ports_snapshot();
        assert_eq!(ports["alpha"], f.base_port);
        assert_ne!(ports["beta"], ports["alpha"]);
    }

    #[tokio::test]
    async fn test_delete_releases_everything() {
        let f = Fleet::start().await;
        f.ready("alpha").await;
        let agent = f
            .orchestrator
            .tunnels()
            .session("alpha", TunnelKind::ClusterAgent)
            .unwrap();

        f.orchestrator.delete_cluster("alpha").await.unwrap();

        assert!(f.orchestrator.list_clusters().is_empty());
        assert!(f.orchestrator.proxies().port("alpha").is_none());
        assert!(!agent.is_live());
        assert_eq!(f.orchestrator.tunnels().active_sessions(), 0);
        assert!(f.persisted().is_empty());

        for _ in 0..40 {
            if !f.plane.deleted_namespaces().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(f.plane.deleted_namespaces().await, vec!["fleet-alpha"]);

        // The counter has moved past the freed port
        f.ready("beta").await;
        assert_eq!(f.orchestrator.proxies().port("beta"), Some(f.base_port + 1));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let f = Fleet::start().await;
        let err = f.orchestrator.delete_cluster("ghost").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_credential_timeout_fails_but_keeps_resources() {
        let plane = MockControlPlane::new();
        plane.set_withhold_secrets(true).await;
        let f = Fleet::start_with(plane, 3).await;

        f.orchestrator.create_cluster("alpha").await.unwrap();
        let failed = f.wait_status("alpha", ClusterStatus::Failed).await;
        assert_eq!(failed.failed_stage, Some(Stage::BootstrapCredential));
        assert!(failed.message.is_some());

        assert!(f.plane.namespace_exists("fleet-alpha").await.unwrap());
        assert!(f.orchestrator.proxies().port("alpha").is_some());
    }

    #[tokio::test]
    async fn test_control_plane_failure_marks_failed() {
        let plane = MockControlPlane::new();
        plane.set_fail_ensure(true).await;
        let f = Fleet::start_with(plane, 3).await;

        f.orchestrator.create_cluster("alpha").await.unwrap();
        let failed = f.wait_status("alpha", ClusterStatus::Failed).await;
        assert_eq!(failed.failed_stage, Some(Stage::EnsureControlPlane));
        assert_eq!(f.plane.ensure_calls().await, 2);

        // Failed clusters can still be deleted
        f.orchestrator.delete_cluster("alpha").await.unwrap();
        assert!(f.orchestrator.list_clusters().is_empty());
    }

    #[tokio::test]
    async fn test_reentry_on_ready_cluster_is_idempotent() {
        let f = Fleet::start().await;
        f.ready("alpha").await;
        let port = f.orchestrator.proxies().port("alpha");

        f.orchestrator
            .resume("alpha", Stage::EnsureControlPlane)
            .await
            .unwrap();
        f.orchestrator.wait_idle("alpha").await;

        let cluster = f.orchestrator.get_cluster("alpha").unwrap().cluster;
        assert_eq!(cluster.status, ClusterStatus::Ready);
        assert_eq!(f.orchestrator.proxies().port("alpha"), port);
        assert_eq!(f.plane.count("Namespace").await, 1);
        assert_eq!(f.plane.count("Node").await, 3);
        assert_eq!(f.controller.manifest_calls(), 1);
        assert_eq!(f.controller.connections("alpha:cluster-agent"), 1);
        assert_eq!(f.orchestrator.tunnels().active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_pipeline_is_rejected() {
        let plane = MockControlPlane::new();
        plane.set_withhold_secrets(true).await;
        let f = Fleet::start_with(plane, 10_000).await;

        f.orchestrator.create_cluster("alpha").await.unwrap();
        f.wait_status("alpha", ClusterStatus::AwaitingCredential).await;
        assert!(f.orchestrator.is_in_flight("alpha"));

        let err = f
            .orchestrator
            .resume("alpha", Stage::Connect)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::PipelineBusy { .. }));

        // Delete cancels the stuck pipeline instead of waiting it out
        tokio::time::timeout(Duration::from_secs(5), f.orchestrator.delete_cluster("alpha"))
            .await
            .unwrap()
            .unwrap();
        assert!(!f.orchestrator.is_in_flight("alpha"));
    }

    #[tokio::test]
    async fn test_rejected_credential_is_rebootstrapped() {
        let f = Fleet::start().await;
        f.ready("alpha").await;

        f.controller.revoke_credentials("alpha");

        for _ in 0..200 {
            if f.controller.connections("alpha:cluster-agent") >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(f.controller.connections("alpha:cluster-agent"), 2);
        assert_eq!(f.controller.manifest_calls(), 2);
        assert_eq!(
            f.orchestrator.get_cluster("alpha").unwrap().cluster.status,
            ClusterStatus::Ready
        );
    }
}
