use crate::command::bounded;
use crate::control_plane::ControlPlane;
use crate::error::Result;
use crate::templates::{inventory, node_status_patch, tenant_manifest, TemplateConfig};
use fleetsim_core::{tenant_namespace, Inventory};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates and removes the objects that represent a logical cluster inside
/// the shared control plane
#[derive(Clone)]
pub struct TenantProvisioner {
    control_plane: Arc<dyn ControlPlane>,
    templates: TemplateConfig,
    /// Bound of every single control plane call
    call_timeout: Duration,
}

impl TenantProvisioner {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        templates: TemplateConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            control_plane,
            templates,
            call_timeout,
        }
    }

    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.control_plane
    }

    /// Create or start the shared control plane. Idempotent.
    pub async fn ensure_control_plane(&self) -> Result<()> {
        bounded(
            "ensure shared control plane",
            self.call_timeout,
            self.control_plane.ensure_running(),
        )
        .await
    }

    /// Apply the tenant namespace, nodes and pods, then patch node capacity.
    ///
    /// Node status is reset when a node is first created, so capacity only
    /// sticks when patched afterwards.
    pub async fn provision(&self, cluster: &str) -> Result<Inventory> {
        let manifest = tenant_manifest(cluster, &self.templates)?;
        let inventory = inventory(cluster, &self.templates);

        bounded(
            &format!("apply tenant manifest for {}", cluster),
            self.call_timeout,
            self.control_plane.apply_manifest(&manifest),
        )
        .await?;

        let patch = node_status_patch(&self.templates);
        for node in &inventory.nodes {
            bounded(
                &format!("patch status of node {}", node),
                self.call_timeout,
                self.control_plane.patch_node_status(node, &patch),
            )
            .await?;
            debug!(cluster, node = %node, "Patched node capacity");
        }

        info!(
            cluster,
            nodes = inventory.nodes.len(),
            pods = inventory.pods.len(),
            "Provisioned tenant namespace {}",
            tenant_namespace(cluster)
        );
        Ok(inventory)
    }

    pub async fn is_provisioned(&self, cluster: &str) -> Result<bool> {
        bounded(
            "check tenant namespace",
            self.call_timeout,
            self.control_plane.namespace_exists(&tenant_namespace(cluster)),
        )
        .await
    }

    /// Remove the tenant's namespace and nodes in the background.
    ///
    /// Namespace deletion can hang in the control plane, so nothing waits on
    /// it; failures are only logged.
    pub fn deprovision(&self, cluster: &str) -> JoinHandle<()> {
        let control_plane = self.control_plane.clone();
        let limit = self.call_timeout;
        let cluster = cluster.to_string();

        tokio::spawn(async move {
            let namespace = tenant_namespace(&cluster);
            if let Err(e) = bounded(
                &format!("delete namespace {}", namespace),
                limit,
                control_plane.delete_namespace(&namespace),
            )
            .await
            {
                warn!(cluster = %cluster, "Failed to delete tenant namespace: {}", e);
            }
            if let Err(e) = bounded(
                &format!("delete nodes of {}", cluster),
                limit,
                control_plane.delete_nodes(&cluster),
            )
            .await
            {
                warn!(cluster = %cluster, "Failed to delete tenant nodes: {}", e);
            }
            debug!(cluster = %cluster, "Tenant deprovisioned");
        })
    }
}
