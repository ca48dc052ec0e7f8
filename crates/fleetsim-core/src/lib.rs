//! Fleetsim Core - Fundamental types for the simulated cluster fleet
//!
//! This crate provides:
//! - The `LogicalCluster` record and its status state machine
//! - Pipeline stages and tunnel kinds shared by every component
//! - The persisted fleet snapshot format
//! - Name validation and derived resource names
//! - Error types with miette diagnostics

pub mod error;
pub mod naming;
pub mod types;

// Re-export commonly used types
pub use error::{FleetError, Result};
pub use naming::{node_name, pod_name, tenant_namespace, validate_cluster_name};
pub use types::{
    ClusterStatus, ClusterSummary, Inventory, LogicalCluster, PersistedState, Stage, TunnelKind,
    STATE_FORMAT_VERSION,
};

/// Serialize a value to pretty JSON
pub fn to_json_pretty<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| {
        FleetError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a value from JSON bytes
pub fn from_json_slice<T: for<'de> serde::Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| {
        FleetError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}
