use crate::command::bounded;
use crate::controller_client::ControllerApi;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use fleetsim_core::ClusterStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive polls a cluster must be missing from the controller before
/// it is torn down
const MISSES_BEFORE_DELETE: u32 = 2;

/// Deletion watcher configuration
#[derive(Debug, Clone)]
pub struct DeletionWatcherConfig {
    /// Gap between two polls of the controller
    pub interval: Duration,
    /// Limit on one cluster listing call
    pub call_timeout: Duration,
}

impl Default for DeletionWatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Tears down clusters the controller no longer knows
pub struct DeletionWatcher {
    orchestrator: Arc<Orchestrator>,
    controller: Arc<dyn ControllerApi>,
    config: DeletionWatcherConfig,
    misses: HashMap<String, u32>,
}

impl DeletionWatcher {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        controller: Arc<dyn ControllerApi>,
        config: DeletionWatcherConfig,
    ) -> Self {
        Self {
            orchestrator,
            controller,
            config,
            misses: HashMap::new(),
        }
    }

    /// Poll until `token` is cancelled
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            call_timeout = ?self.config.call_timeout,
            "Starting deletion watcher"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Deletion watcher shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                warn!("Deletion watcher poll failed: {}", e);
            }
        }
    }

    /// Compare once against the controller; returns the clusters deleted.
    ///
    /// A failed controller call counts as no observation at all. A cluster
    /// whose teardown fails is logged and skipped; the others still go.
    pub async fn poll_once(&mut self) -> Result<Vec<String>> {
        let registered = bounded(
            "list controller clusters",
            self.config.call_timeout,
            self.controller.list_cluster_ids(),
        )
        .await?;

        let clusters = self.orchestrator.clusters();
        self.misses
            .retain(|name, _| clusters.iter().any(|c| &c.name == name));

        let mut deleted = Vec::new();
        for cluster in clusters {
            let id = match &cluster.cluster_id {
                Some(id) => id,
                None => continue,
            };
            if matches!(
                cluster.status,
                ClusterStatus::Deleting | ClusterStatus::Deleted
            ) {
                continue;
            }

            if registered.contains(id) {
                self.misses.remove(&cluster.name);
                continue;
            }

            let misses = self.misses.entry(cluster.name.clone()).or_insert(0);
            *misses += 1;
            if *misses < MISSES_BEFORE_DELETE {
                debug!(cluster = %cluster.name, cluster_id = %id, "Cluster missing from controller");
                continue;
            }

            info!(cluster = %cluster.name, cluster_id = %id, "Cluster removed from controller, deleting");
            self.misses.remove(&cluster.name);
            match self.orchestrator.delete_cluster(&cluster.name).await {
                Ok(()) => deleted.push(cluster.name),
                Err(e) => warn!(
                    cluster = %cluster.name,
                    cluster_id = %id,
                    "Failed to delete cluster removed from controller: {}",
                    e
                ),
            }
        }
        Ok(deleted)
    }
}
