//! Startup reconciliation of persisted clusters against the outside world

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use fleetsim_core::{tenant_namespace, ClusterStatus, LogicalCluster, Stage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What rehydration did with each persisted cluster
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RehydrationReport {
    /// Clusters whose pipeline was resumed, with the stage it resumed at
    pub resumed: Vec<(String, Stage)>,
    /// Clusters caught mid-deletion whose teardown was finished
    pub torn_down: Vec<String>,
    /// Terminal clusters left as they are
    pub skipped: Vec<String>,
}

/// Resume every non-terminal persisted cluster at the first stage whose
/// outcome is not already in place
pub async fn rehydrate(orchestrator: &Arc<Orchestrator>) -> Result<RehydrationReport> {
    let mut report = RehydrationReport::default();
    let clusters = orchestrator.clusters();
    if clusters.is_empty() {
        debug!("Nothing to rehydrate");
        return Ok(report);
    }

    let plane_ready = if clusters.iter().any(|c| !c.status.is_terminal()) {
        control_plane_ready(orchestrator).await
    } else {
        false
    };

    for cluster in clusters {
        let name = cluster.name.clone();
        if cluster.status.is_terminal() {
            debug!(cluster = %name, status = %cluster.status, "Skipping terminal cluster");
            report.skipped.push(name);
            continue;
        }
        if cluster.status == ClusterStatus::Deleting {
            info!(cluster = %name, "Finishing interrupted deletion");
            orchestrator.resume(&name, Stage::EnsureControlPlane).await?;
            report.torn_down.push(name);
            continue;
        }

        let stage = if plane_ready {
            first_unsatisfied(orchestrator, &cluster).await
        } else {
            Stage::EnsureControlPlane
        };
        info!(cluster = %name, status = %cluster.status, stage = %stage, "Rehydrating cluster");
        orchestrator.resume(&name, stage).await?;
        report.resumed.push((name, stage));
    }

    info!(
        resumed = report.resumed.len(),
        torn_down = report.torn_down.len(),
        skipped = report.skipped.len(),
        "Rehydration complete"
    );
    Ok(report)
}

async fn control_plane_ready(orchestrator: &Orchestrator) -> bool {
    let provisioner = orchestrator.provisioner();
    match provisioner.control_plane().is_provisioned().await {
        Ok(true) => {}
        Ok(false) => warn!("Shared control plane is gone; persisted clusters start over"),
        Err(e) => warn!("Failed to look for the shared control plane: {}", e),
    }
    match provisioner.ensure_control_plane().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Shared control plane not available: {}", e);
            false
        }
    }
}

/// First stage whose precondition does not hold yet. A persisted port gets
/// its listener back here, since listeners never outlive the process.
async fn first_unsatisfied(orchestrator: &Orchestrator, cluster: &LogicalCluster) -> Stage {
    let name = cluster.name.as_str();

    match orchestrator.provisioner().is_provisioned(name).await {
        Ok(true) => {}
        Ok(false) => return Stage::ProvisionTenant,
        Err(e) => {
            warn!(cluster = name, "Failed to check tenant namespace: {}", e);
            return Stage::ProvisionTenant;
        }
    }

    if orchestrator.proxies().port(name).is_none() {
        return Stage::StartProxy;
    }
    if let Err(e) = orchestrator.proxies().start_proxy(name).await {
        warn!(cluster = name, "Failed to restart proxy: {}", e);
        return Stage::StartProxy;
    }

    if cluster.cluster_id.is_none() {
        return Stage::BootstrapCredential;
    }
    match orchestrator
        .credentials()
        .current_token(&tenant_namespace(name))
        .await
    {
        Ok(Some(_)) => Stage::Connect,
        Ok(None) => Stage::BootstrapCredential,
        Err(e) => {
            warn!(cluster = name, "Failed to read credential secret: {}", e);
            Stage::BootstrapCredential
        }
    }
}
