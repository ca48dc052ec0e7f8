use crate::command::{exec, exec_unchecked, exec_with_stdin};
use crate::control_plane::{
    tokens_from_secret_list, ApiProbe, ControlPlane, PlaneHealth, CLUSTER_LABEL,
};
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the kwok-backed control plane
#[derive(Debug, Clone)]
pub struct KwokConfig {
    /// Name of the one shared kwok cluster
    pub cluster_name: String,
    /// Port the kube-apiserver is published on
    pub api_port: u16,
    /// Whether the API is expected to speak HTTPS
    pub secure: bool,
    pub kwokctl: String,
    pub kubectl: String,
    /// Directory holding kwokctl's per-cluster state
    pub clusters_dir: PathBuf,
    /// Bound on each kwokctl/kubectl invocation
    pub command_timeout: Duration,
    /// How long to wait for a (re)created API to answer
    pub ready_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for KwokConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            cluster_name: "fleetsim".to_string(),
            api_port: 6443,
            secure: true,
            kwokctl: "kwokctl".to_string(),
            kubectl: "kubectl".to_string(),
            clusters_dir: home.join(".kwok").join("clusters"),
            command_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(180),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Shared control plane driven through `kwokctl` and `kubectl`
pub struct KwokControlPlane {
    config: KwokConfig,
    /// Trusts the control plane's self-signed serving certificate
    probe_client: reqwest::Client,
}

impl KwokControlPlane {
    pub fn new(config: KwokConfig) -> Result<Self> {
        let probe_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.probe_timeout)
            .build()
            .map_err(|e| RuntimeError::internal_error(format!("probe client: {}", e)))?;
        Ok(Self {
            config,
            probe_client,
        })
    }

    fn context(&self) -> String {
        format!("kwok-{}", self.config.cluster_name)
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        let context = self.context();
        let mut full = vec!["--context", context.as_str()];
        full.extend_from_slice(args);
        let output = exec(&self.config.kubectl, &full, self.config.command_timeout).await?;
        Ok(output.stdout)
    }

    async fn kwokctl(&self, args: &[&str]) -> Result<()> {
        exec(&self.config.kwokctl, args, self.config.command_timeout).await?;
        Ok(())
    }

    /// Ask the API port which scheme answers
    pub async fn probe(&self) -> ApiProbe {
        let port = self.config.api_port;
        if self
            .probe_client
            .get(format!("https://127.0.0.1:{}/livez", port))
            .send()
            .await
            .is_ok()
        {
            return ApiProbe::Https;
        }
        if self
            .probe_client
            .get(format!("http://127.0.0.1:{}/livez", port))
            .send()
            .await
            .is_ok()
        {
            return ApiProbe::PlainHttp;
        }
        ApiProbe::Unreachable
    }

    async fn create(&self) -> Result<()> {
        let port = self.config.api_port.to_string();
        let secure = format!("--secure-port={}", self.config.secure);
        info!(
            cluster = %self.config.cluster_name,
            port = self.config.api_port,
            "Creating shared control plane"
        );
        self.kwokctl(&[
            "create",
            "cluster",
            "--name",
            &self.config.cluster_name,
            "--kube-apiserver-port",
            &port,
            &secure,
            "--kube-authorization=false",
        ])
        .await
    }

    async fn start(&self) -> Result<()> {
        info!(cluster = %self.config.cluster_name, "Starting stopped shared control plane");
        self.kwokctl(&["start", "cluster", "--name", &self.config.cluster_name])
            .await
    }

    async fn delete(&self) -> Result<()> {
        warn!(cluster = %self.config.cluster_name, "Deleting shared control plane");
        self.kwokctl(&["delete", "cluster", "--name", &self.config.cluster_name])
            .await
    }

    async fn wait_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            match self.probe().await.classify(self.config.secure) {
                PlaneHealth::Healthy => return Ok(()),
                PlaneHealth::Corrupt => {
                    return Err(RuntimeError::control_plane(
                        "API answers with the wrong scheme after creation",
                    ))
                }
                PlaneHealth::Down => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::timeout(
                    "control plane API to answer",
                    self.config.ready_timeout.as_secs(),
                ));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[async_trait]
impl ControlPlane for KwokControlPlane {
    fn api_url(&self) -> String {
        let scheme = if self.config.secure { "https" } else { "http" };
        format!("{}://127.0.0.1:{}", scheme, self.config.api_port)
    }

    async fn is_provisioned(&self) -> Result<bool> {
        let dir = self.config.clusters_dir.join(&self.config.cluster_name);
        Ok(tokio::fs::try_exists(&dir).await.unwrap_or(false))
    }

    async fn ensure_running(&self) -> Result<()> {
        match self.probe().await.classify(self.config.secure) {
            PlaneHealth::Healthy => {
                debug!("Shared control plane is healthy");
                return Ok(());
            }
            PlaneHealth::Corrupt => {
                warn!(
                    port = self.config.api_port,
                    "Control plane answers with the wrong scheme, recreating"
                );
                self.delete().await?;
                self.create().await?;
            }
            PlaneHealth::Down => {
                if self.is_provisioned().await? {
                    self.start().await?;
                } else {
                    self.create().await?;
                }
            }
        }
        self.wait_ready().await
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let context = self.context();
        let output = exec_unchecked(
            &self.config.kubectl,
            &["--context", &context, "get", "namespace", namespace, "-o", "name"],
            self.config.command_timeout,
        )
        .await?;
        if output.success() {
            return Ok(true);
        }
        if output.stderr.contains("NotFound") || output.stderr.contains("not found") {
            return Ok(false);
        }
        Err(RuntimeError::command_failed(
            format!("kubectl get namespace {}", namespace),
            output.exit_code,
            output.stderr.trim(),
        ))
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        let context = self.context();
        exec_with_stdin(
            &self.config.kubectl,
            &["--context", &context, "apply", "-f", "-"],
            manifest.as_bytes(),
            self.config.command_timeout,
        )
        .await?;
        Ok(())
    }

    async fn patch_node_status(&self, node: &str, patch: &serde_json::Value) -> Result<()> {
        let body = patch.to_string();
        self.kubectl(&[
            "patch",
            "node",
            node,
            "--subresource=status",
            "--type=merge",
            "-p",
            &body,
        ])
        .await?;
        Ok(())
    }

    async fn find_secret_tokens(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<Vec<(String, String)>> {
        let json = self
            .kubectl(&["get", "secrets", "-n", namespace, "-o", "json"])
            .await?;
        tokens_from_secret_list(&json, prefix)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.kubectl(&[
            "delete",
            "namespace",
            namespace,
            "--wait=false",
            "--ignore-not-found",
        ])
        .await?;
        Ok(())
    }

    async fn delete_nodes(&self, cluster: &str) -> Result<()> {
        let selector = format!("{}={}", CLUSTER_LABEL, cluster);
        self.kubectl(&[
            "delete",
            "nodes",
            "-l",
            &selector,
            "--wait=false",
            "--ignore-not-found",
        ])
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_follows_scheme() {
        let plane = KwokControlPlane::new(KwokConfig {
            api_port: 32766,
            ..KwokConfig::default()
        })
        .unwrap();
        assert_eq!(plane.api_url(), "https://127.0.0.1:32766");

        let plane = KwokControlPlane::new(KwokConfig {
            secure: false,
            api_port: 32766,
            ..KwokConfig::default()
        })
        .unwrap();
        assert_eq!(plane.api_url(), "http://127.0.0.1:32766");
        assert_eq!(plane.context(), "kwok-fleetsim");
    }

    #[tokio::test]
    async fn test_is_provisioned_checks_cluster_directory() {
        let dir = tempfile::tempdir().unwrap();
        let plane = KwokControlPlane::new(KwokConfig {
            clusters_dir: dir.path().to_path_buf(),
            ..KwokConfig::default()
        })
        .unwrap();
        assert!(!plane.is_provisioned().await.unwrap());

        std::fs::create_dir_all(dir.path().join("fleetsim")).unwrap();
        assert!(plane.is_provisioned().await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_detects_plain_http() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route("/livez", axum::routing::get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let plane = KwokControlPlane::new(KwokConfig {
            api_port: port,
            ..KwokConfig::default()
        })
        .unwrap();
        let probe = plane.probe().await;
        assert_eq!(probe, ApiProbe::PlainHttp);
        assert_eq!(probe.classify(true), PlaneHealth::Corrupt);
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let plane = KwokControlPlane::new(KwokConfig {
            api_port: port,
            ..KwokConfig::default()
        })
        .unwrap();
        assert_eq!(plane.probe().await, ApiProbe::Unreachable);
    }
}
