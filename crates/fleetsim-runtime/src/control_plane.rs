use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;

/// Label carried by every object created for a logical cluster
pub const CLUSTER_LABEL: &str = "fleetsim.io/cluster";

/// Capabilities the lifecycle needs from the shared control plane
///
/// This trait abstracts the external tools that create and mutate the
/// simulated control plane. It enables testing via `MockControlPlane`
/// without a local kwok installation.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Base URL of the control plane API, the target of every proxy
    fn api_url(&self) -> String;

    /// Whether the control plane's on-disk cluster directory exists
    async fn is_provisioned(&self) -> Result<bool>;

    /// Create or start the control plane and wait for its API. Idempotent.
    async fn ensure_running(&self) -> Result<()>;

    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    /// Apply a (multi-document) YAML manifest
    async fn apply_manifest(&self, manifest: &str) -> Result<()>;

    /// Merge-patch a node's status subresource
    async fn patch_node_status(&self, node: &str, patch: &serde_json::Value) -> Result<()>;

    /// `(secret name, token)` for every secret in `namespace` whose name
    /// starts with `prefix` and carries a `token` key
    async fn find_secret_tokens(&self, namespace: &str, prefix: &str)
        -> Result<Vec<(String, String)>>;

    /// Request namespace deletion without waiting for it to finish
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    /// Delete the cluster-scoped nodes labelled with `cluster`
    async fn delete_nodes(&self, cluster: &str) -> Result<()>;
}

/// What answered on the control plane's API port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiProbe {
    Https,
    PlainHttp,
    Unreachable,
}

/// Control plane health derived from a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneHealth {
    Healthy,
    /// Answering with the wrong scheme; must be recreated
    Corrupt,
    Down,
}

impl ApiProbe {
    pub fn classify(&self, expect_https: bool) -> PlaneHealth {
        match (self, expect_https) {
            (ApiProbe::Unreachable, _) => PlaneHealth::Down,
            (ApiProbe::Https, true) | (ApiProbe::PlainHttp, false) => PlaneHealth::Healthy,
            (ApiProbe::Https, false) | (ApiProbe::PlainHttp, true) => PlaneHealth::Corrupt,
        }
    }
}

#[derive(Deserialize)]
struct SecretList {
    #[serde(default)]
    items: Vec<Secret>,
}

/// Extract matching tokens from `kubectl get secrets -o json` output
pub fn tokens_from_secret_list(json: &str, prefix: &str) -> Result<Vec<(String, String)>> {
    let list: SecretList = serde_json::from_str(json)
        .map_err(|e| RuntimeError::control_plane(format!("unparseable secret list: {}", e)))?;

    let mut found = Vec::new();
    for secret in list.items {
        let name = match secret.metadata.name {
            Some(name) if name.starts_with(prefix) => name,
            _ => continue,
        };
        let token = secret
            .data
            .as_ref()
            .and_then(|d| d.get("token"))
            .and_then(|b| String::from_utf8(b.0.clone()).ok())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|d| d.get("token"))
                    .cloned()
            });
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            found.push((name, token));
        }
    }
    found.sort();
    Ok(found)
}
