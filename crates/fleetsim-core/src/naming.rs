//! Derived names for the objects backing a logical cluster

use crate::error::{FleetError, Result};

/// Prefix of every tenant namespace
pub const NAMESPACE_PREFIX: &str = "fleet-";

/// Namespace names are DNS-1123 labels (max 63), minus the prefix
pub const MAX_CLUSTER_NAME_LEN: usize = 63 - NAMESPACE_PREFIX.len();

/// Validate an operator-supplied cluster name (DNS-1123 label)
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FleetError::invalid_name(
            name,
            "name is empty",
            MAX_CLUSTER_NAME_LEN,
        ));
    }
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(FleetError::invalid_name(
            name,
            "name is too long",
            MAX_CLUSTER_NAME_LEN,
        ));
    }

    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return Err(FleetError::invalid_name(
            name,
            "name must start and end with a lowercase letter or digit",
            MAX_CLUSTER_NAME_LEN,
        ));
    }
    if !bytes.iter().all(|b| edge_ok(*b) || *b == b'-') {
        return Err(FleetError::invalid_name(
            name,
            "name may only contain lowercase letters, digits and '-'",
            MAX_CLUSTER_NAME_LEN,
        ));
    }
    Ok(())
}

/// Tenant namespace for a cluster
pub fn tenant_namespace(cluster_name: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, cluster_name)
}

/// Nodes are cluster-scoped in the shared control plane, so they carry the
/// cluster name to stay unique across tenants.
pub fn node_name(cluster_name: &str, index: usize) -> String {
    format!("{}-node-{}", cluster_name, index)
}

pub fn pod_name(node_name: &str, index: usize) -> String {
    format!("{}-pod-{}", node_name, index)
}
