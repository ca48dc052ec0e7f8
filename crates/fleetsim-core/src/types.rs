use crate::error::{FleetError, Result};
use crate::naming::tenant_namespace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Format tag written into every persisted snapshot
pub const STATE_FORMAT_VERSION: &str = "1";

/// Lifecycle status of a logical cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    Creating,
    Provisioning,
    AwaitingCredential,
    Connecting,
    Ready,
    Deleting,
    Deleted,
    Failed,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Creating => "Creating",
            ClusterStatus::Provisioning => "Provisioning",
            ClusterStatus::AwaitingCredential => "AwaitingCredential",
            ClusterStatus::Connecting => "Connecting",
            ClusterStatus::Ready => "Ready",
            ClusterStatus::Deleting => "Deleting",
            ClusterStatus::Deleted => "Deleted",
            ClusterStatus::Failed => "Failed",
        }
    }

    /// `Deleted` and `Failed` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClusterStatus::Deleted | ClusterStatus::Failed)
    }

    /// Position along the happy path, `None` for the off-path statuses
    fn happy_path_rank(&self) -> Option<u8> {
        match self {
            ClusterStatus::Creating => Some(0),
            ClusterStatus::Provisioning => Some(1),
            ClusterStatus::AwaitingCredential => Some(2),
            ClusterStatus::Connecting => Some(3),
            ClusterStatus::Ready => Some(4),
            _ => None,
        }
    }

    /// Whether the lifecycle permits moving from `self` to `to`.
    ///
    /// Staying in place is allowed so stage re-entry can re-persist.
    pub fn can_transition_to(&self, to: ClusterStatus) -> bool {
        if *self == to {
            return true;
        }
        match (self, to) {
            (ClusterStatus::Deleted, _) => false,
            // A failed cluster may still be torn down
            (ClusterStatus::Failed, ClusterStatus::Deleting) => true,
            (ClusterStatus::Failed, _) => false,
            (ClusterStatus::Deleting, ClusterStatus::Deleted) => true,
            (ClusterStatus::Deleting, ClusterStatus::Failed) => true,
            (ClusterStatus::Deleting, _) => false,
            (_, ClusterStatus::Deleting) | (_, ClusterStatus::Failed) => true,
            (_, ClusterStatus::Deleted) => false,
            (from, to) => match (from.happy_path_rank(), to.happy_path_rank()) {
                (Some(a), Some(b)) => b >= a,
                _ => false,
            },
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step of the per-cluster provisioning pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    EnsureControlPlane,
    ProvisionTenant,
    StartProxy,
    BootstrapCredential,
    Connect,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::EnsureControlPlane,
        Stage::ProvisionTenant,
        Stage::StartProxy,
        Stage::BootstrapCredential,
        Stage::Connect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::EnsureControlPlane => "ensure-control-plane",
            Stage::ProvisionTenant => "provision-tenant",
            Stage::StartProxy => "start-proxy",
            Stage::BootstrapCredential => "bootstrap-credential",
            Stage::Connect => "connect",
        }
    }

    /// Status a cluster reports while this stage runs
    pub fn status(&self) -> ClusterStatus {
        match self {
            Stage::EnsureControlPlane | Stage::ProvisionTenant | Stage::StartProxy => {
                ClusterStatus::Provisioning
            }
            Stage::BootstrapCredential => ClusterStatus::AwaitingCredential,
            Stage::Connect => ClusterStatus::Connecting,
        }
    }

    /// Stages from `self` (inclusive) to the end of the pipeline
    pub fn remaining(&self) -> impl Iterator<Item = Stage> {
        let start = *self;
        Stage::ALL.into_iter().filter(move |s| *s >= start)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The two tunnel sessions every Ready cluster keeps open
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelKind {
    ClusterAgent,
    SteveProxy,
}

impl TunnelKind {
    pub const ALL: [TunnelKind; 2] = [TunnelKind::ClusterAgent, TunnelKind::SteveProxy];

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::ClusterAgent => "cluster-agent",
            TunnelKind::SteveProxy => "steve-proxy",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Template objects created for a cluster, kept for display only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<String>,
}

/// A simulated cluster managed by the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalCluster {
    /// Operator-chosen unique name
    pub name: String,
    /// Local identifier, assigned at creation
    pub id: String,
    /// Identifier assigned by the controller on registration
    #[serde(rename = "clusterID", default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub status: ClusterStatus,
    /// Tenant namespace inside the shared control plane
    pub namespace: String,
    /// Stage that failed, set together with `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub inventory: Inventory,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LogicalCluster {
    /// A freshly registered cluster in `Creating`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            namespace: tenant_namespace(&name),
            id: uuid::Uuid::new_v4().to_string(),
            name,
            cluster_id: None,
            status: ClusterStatus::Creating,
            failed_stage: None,
            message: None,
            inventory: Inventory::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, enforcing the lifecycle rules
    pub fn transition(&mut self, to: ClusterStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(FleetError::invalid_transition(
                &self.name,
                self.status.as_str(),
                to.as_str(),
            ));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record an unrecoverable failure in `stage`
    pub fn fail(&mut self, stage: Stage, message: impl Into<String>) -> Result<()> {
        self.transition(ClusterStatus::Failed)?;
        self.failed_stage = Some(stage);
        self.message = Some(message.into());
        Ok(())
    }

    pub fn summary(&self, proxy_port: Option<u16>) -> ClusterSummary {
        ClusterSummary {
            name: self.name.clone(),
            id: self.id.clone(),
            status: self.status,
            proxy_port,
            cluster_id: self.cluster_id.clone(),
            failed_stage: self.failed_stage,
            message: self.message.clone(),
        }
    }
}

/// Row returned by `GET /clusters`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub id: String,
    pub status: ClusterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(rename = "clusterID", default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Serialized snapshot of the whole fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: String,
    #[serde(default)]
    pub clusters: BTreeMap<String, LogicalCluster>,
    #[serde(default)]
    pub proxy_ports: BTreeMap<String, u16>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_FORMAT_VERSION.to_string(),
            clusters: BTreeMap::new(),
            proxy_ports: BTreeMap::new(),
        }
    }
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.proxy_ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_moves_forward_only() {
        use ClusterStatus::*;
        assert!(Creating.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(AwaitingCredential));
        assert!(Connecting.can_transition_to(Ready));
        assert!(Creating.can_transition_to(Connecting));
        assert!(Ready.can_transition_to(Ready));

        assert!(!Ready.can_transition_to(Connecting));
        assert!(!AwaitingCredential.can_transition_to(Provisioning));
    }

    #[test]
    fn test_deleting_and_failed_rules() {
        use ClusterStatus::*;
        assert!(Ready.can_transition_to(Deleting));
        assert!(Creating.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));

        assert!(!Ready.can_transition_to(Deleted));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Deleting.can_transition_to(Ready));
        assert!(!Deleted.can_transition_to(Deleting));
    }

    #[test]
    fn test_transition_rejects_regression() {
        let mut cluster = LogicalCluster::new("alpha");
        cluster.transition(ClusterStatus::Ready).unwrap();
        let err = cluster.transition(ClusterStatus::Provisioning).unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
        assert_eq!(cluster.status, ClusterStatus::Ready);
    }

    #[test]
    fn test_fail_records_stage() {
        let mut cluster = LogicalCluster::new("alpha");
        cluster
            .fail(Stage::BootstrapCredential, "secret never appeared")
            .unwrap();
        assert_eq!(cluster.status, ClusterStatus::Failed);
        assert_eq!(cluster.failed_stage, Some(Stage::BootstrapCredential));
        assert!(cluster.status.is_terminal());
    }

    #[test]
    fn test_new_cluster_derives_namespace() {
        let cluster = LogicalCluster::new("test-cluster-012");
        assert_eq!(cluster.namespace, "fleet-test-cluster-012");
        assert!(!cluster.id.is_empty());
        assert!(cluster.cluster_id.is_none());
    }

    #[test]
    fn test_stage_remaining_and_status() {
        let rest: Vec<Stage> = Stage::StartProxy.remaining().collect();
        assert_eq!(
            rest,
            vec![Stage::StartProxy, Stage::BootstrapCredential, Stage::Connect]
        );
        assert_eq!(Stage::Connect.status(), ClusterStatus::Connecting);
        assert_eq!(
            Stage::BootstrapCredential.status(),
            ClusterStatus::AwaitingCredential
        );
    }

    #[test]
    fn test_summary_serializes_controller_id() {
        let mut cluster = LogicalCluster::new("alpha");
        cluster.cluster_id = Some("c-m-abc123".to_string());
        let json = serde_json::to_value(cluster.summary(Some(8440))).unwrap();
        assert_eq!(json["clusterID"], "c-m-abc123");
        assert_eq!(json["proxyPort"], 8440);
        assert_eq!(json["status"], "Creating");
    }

    #[test]
    fn test_tunnel_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&TunnelKind::SteveProxy).unwrap(),
            "\"steve-proxy\""
        );
        assert_eq!(TunnelKind::ClusterAgent.to_string(), "cluster-agent");
    }
}
