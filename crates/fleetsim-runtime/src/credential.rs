use crate::command::bounded;
use crate::control_plane::ControlPlane;
use crate::controller_client::ControllerApi;
use crate::error::{Result, RuntimeError};
use crate::manifest::scope_manifest;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Credential bootstrap configuration
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Secret lookups before giving up
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    /// Namespace the controller's manifest targets
    pub agent_namespace: String,
    /// Name prefix of the secret carrying the tunnel credential
    pub secret_prefix: String,
    /// Bound of each controller and control plane call
    pub call_timeout: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 30,
            poll_interval: Duration::from_secs(2),
            agent_namespace: "cattle-system".to_string(),
            secret_prefix: "cattle-credentials-".to_string(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Synthetic bearer identity of a cluster's steve-proxy session
pub fn steve_credential(cluster_id: &str) -> String {
    format!("stv-{}", cluster_id)
}

/// Trades the controller's registration manifest for a tunnel credential
pub struct CredentialBootstrapper {
    controller: Arc<dyn ControllerApi>,
    control_plane: Arc<dyn ControlPlane>,
    config: CredentialConfig,
}

impl CredentialBootstrapper {
    pub fn new(
        controller: Arc<dyn ControllerApi>,
        control_plane: Arc<dyn ControlPlane>,
        config: CredentialConfig,
    ) -> Self {
        Self {
            controller,
            control_plane,
            config,
        }
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Latest credential already present in `namespace`, if any
    pub async fn current_token(&self, namespace: &str) -> Result<Option<String>> {
        let found = self.secret_tokens(namespace).await?;
        Ok(found.into_iter().last().map(|(_, token)| token))
    }

    /// Fetch the registration manifest for `cluster_id`, apply it into
    /// `namespace` and wait for the credential secret it produces.
    ///
    /// Only a secret that was not there before the apply counts, unless this
    /// is the first bootstrap (`previous` is `None`), in which case an
    /// existing one is taken too. On an exhausted poll budget everything
    /// applied stays in place.
    pub async fn bootstrap(
        &self,
        cluster: &str,
        cluster_id: &str,
        namespace: &str,
        previous: Option<&str>,
        token: &CancellationToken,
    ) -> Result<String> {
        let manifest = bounded(
            &format!("fetch registration manifest for {}", cluster_id),
            self.config.call_timeout,
            self.controller.registration_manifest(cluster_id),
        )
        .await?;
        let scoped = scope_manifest(&manifest, &self.config.agent_namespace, namespace, cluster)?;

        let before = self.secret_tokens(namespace).await?;

        bounded(
            &format!("apply registration manifest for {}", cluster),
            self.config.call_timeout,
            self.control_plane.apply_manifest(&scoped),
        )
        .await?;
        debug!(cluster, namespace, "Applied registration manifest");

        for attempt in 1..=self.config.poll_attempts {
            let found = self.secret_tokens(namespace).await?;
            let fresh = found
                .iter()
                .filter(|entry| !before.contains(entry))
                .filter(|(_, t)| Some(t.as_str()) != previous)
                .last();
            let picked = match (fresh, previous) {
                (Some(entry), _) => Some(entry),
                (None, None) => found.last(),
                (None, Some(_)) => None,
            };
            if let Some((secret, credential)) = picked {
                info!(cluster, secret = %secret, attempt, "Credential bootstrapped");
                return Ok(credential.clone());
            }

            if attempt < self.config.poll_attempts {
                tokio::select! {
                    _ = token.cancelled() => return Err(RuntimeError::cancelled(cluster)),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        Err(RuntimeError::credential_timeout(
            namespace,
            self.config.poll_attempts,
        ))
    }

    async fn secret_tokens(&self, namespace: &str) -> Result<Vec<(String, String)>> {
        bounded(
            &format!("read credential secrets in {}", namespace),
            self.config.call_timeout,
            self.control_plane
                .find_secret_tokens(namespace, &self.config.secret_prefix),
        )
        .await
    }
}
