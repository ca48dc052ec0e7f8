use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// The fleet-management controller, as seen by the lifecycle
#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Register an imported cluster and return its controller-side ID.
    /// Registering an existing name returns the existing ID.
    async fn register_cluster(&self, name: &str) -> Result<String>;

    /// Fetch the registration manifest for `cluster_id`
    async fn registration_manifest(&self, cluster_id: &str) -> Result<String>;

    /// IDs of every cluster the controller currently knows
    async fn list_cluster_ids(&self) -> Result<HashSet<String>>;
}

/// Controller connection settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Base URL, e.g. "https://rancher.example.com"
    pub url: String,
    /// Operator API token
    pub token: String,
    /// Skip TLS verification (lab controllers with self-signed certs)
    pub insecure: bool,
    pub timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost".to_string(),
            token: String::new(),
            insecure: false,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationToken {
    #[serde(default)]
    manifest_url: String,
}

/// HTTP client for a Rancher-style `/v3` controller API
pub struct RancherClient {
    base_url: String,
    token: String,
    client: Client,
}

impl RancherClient {
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()
            .map_err(|e| RuntimeError::internal_error(format!("controller client: {}", e)))?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let resp = self
            .authed(request)
            .send()
            .await
            .map_err(|e| RuntimeError::controller(format!("{}: {}", what, e), None))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::controller(
                format!("{} failed with status {}: {}", what, status, body),
                Some(status.as_u16()),
            ));
        }

        resp.json::<T>()
            .await
            .map_err(|e| RuntimeError::controller(format!("{}: bad response: {}", what, e), None))
    }

    async fn find_cluster_id(&self, name: &str) -> Result<Option<String>> {
        let url = format!("{}/v3/clusters", self.base_url);
        let found: Collection<IdOnly> = self
            .send(self.client.get(&url).query(&[("name", name)]), "GET clusters by name")
            .await?;
        Ok(found.data.into_iter().next().map(|c| c.id))
    }

    async fn manifest_url(&self, cluster_id: &str) -> Result<String> {
        let url = format!("{}/v3/clusterregistrationtokens", self.base_url);
        let created: RegistrationToken = self
            .send(
                self.client.post(&url).json(&json!({
                    "type": "clusterRegistrationToken",
                    "clusterId": cluster_id,
                })),
                "POST clusterregistrationtokens",
            )
            .await?;
        if !created.manifest_url.is_empty() {
            return Ok(created.manifest_url);
        }

        // Freshly created tokens may not carry the URL yet
        let listed: Collection<RegistrationToken> = self
            .send(
                self.client.get(&url).query(&[("clusterId", cluster_id)]),
                "GET clusterregistrationtokens",
            )
            .await?;
        listed
            .data
            .into_iter()
            .map(|t| t.manifest_url)
            .find(|u| !u.is_empty())
            .ok_or_else(|| {
                RuntimeError::controller(
                    format!("no registration token with a manifest URL for {}", cluster_id),
                    None,
                )
            })
    }
}

#[async_trait]
impl ControllerApi for RancherClient {
    async fn register_cluster(&self, name: &str) -> Result<String> {
        let url = format!("{}/v3/clusters", self.base_url);
        debug!("POST {}", url);

        let created: Result<IdOnly> = self
            .send(
                self.client.post(&url).json(&json!({
                    "type": "cluster",
                    "name": name,
                })),
                "POST clusters",
            )
            .await;

        match created {
            Ok(cluster) => {
                info!(cluster = %name, id = %cluster.id, "Registered cluster with controller");
                Ok(cluster.id)
            }
            Err(RuntimeError::Controller {
                status: Some(status),
                ..
            }) if status == StatusCode::CONFLICT.as_u16()
                || status == StatusCode::UNPROCESSABLE_ENTITY.as_u16() =>
            {
                debug!(cluster = %name, "Cluster already registered, looking up its ID");
                self.find_cluster_id(name).await?.ok_or_else(|| {
                    RuntimeError::controller(
                        format!("controller reports '{}' as duplicate but cannot find it", name),
                        Some(status),
                    )
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn registration_manifest(&self, cluster_id: &str) -> Result<String> {
        let manifest_url = self.manifest_url(cluster_id).await?;
        debug!("GET {}", manifest_url);

        let resp = self
            .authed(self.client.get(&manifest_url))
            .send()
            .await
            .map_err(|e| RuntimeError::controller(format!("GET manifest: {}", e), None))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RuntimeError::controller(
                format!("GET manifest failed with status {}", status),
                Some(status.as_u16()),
            ));
        }
        resp.text()
            .await
            .map_err(|e| RuntimeError::controller(format!("GET manifest: {}", e), None))
    }

    async fn list_cluster_ids(&self) -> Result<HashSet<String>> {
        let url = format!("{}/v3/clusters", self.base_url);
        let clusters: Collection<IdOnly> = self.send(self.client.get(&url), "GET clusters").await?;
        Ok(clusters.data.into_iter().map(|c| c.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Clone)]
    struct Fake {
        base: Arc<parking_lot::Mutex<String>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer op-token")
    }

    async fn create_cluster(headers: HeaderMap, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        if body["name"] == "taken" {
            return AxumStatus::CONFLICT.into_response();
        }
        Json(json!({"id": "c-new01", "name": body["name"]})).into_response()
    }

    async fn list_clusters(Query(q): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
        match q.get("name").map(String::as_str) {
            Some("taken") => Json(json!({"data": [{"id": "c-taken"}]})),
            Some(_) => Json(json!({"data": []})),
            None => Json(json!({"data": [{"id": "local"}, {"id": "c-new01"}]})),
        }
    }

    // Answers without the URL, like a token the controller is still filling in
    async fn create_token() -> Json<serde_json::Value> {
        Json(json!({"manifestUrl": ""}))
    }

    async fn list_tokens(State(fake): State<Fake>) -> Json<serde_json::Value> {
        let base = fake.base.lock().clone();
        Json(json!({"data": [{"manifestUrl": ""}, {"manifestUrl": format!("{}/v3/import/abc.yaml", base)}]}))
    }

    async fn manifest() -> &'static str {
        "kind: Secret\nmetadata:\n  name: cattle-credentials-1\n"
    }

    async fn start() -> RancherClient {
        let fake = Fake {
            base: Arc::new(parking_lot::Mutex::new(String::new())),
        };
        let app = Router::new()
            .route("/v3/clusters", get(list_clusters).post(create_cluster))
            .route(
                "/v3/clusterregistrationtokens",
                get(list_tokens).post(create_token),
            )
            .route("/v3/import/abc.yaml", get(manifest))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        *fake.base.lock() = base.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        RancherClient::new(&ControllerConfig {
            url: format!("{}/", base),
            token: "op-token".to_string(),
            ..ControllerConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_cluster() {
        let client = start().await;
        assert_eq!(client.register_cluster("alpha").await.unwrap(), "c-new01");
    }

    #[tokio::test]
    async fn test_register_existing_name_returns_existing_id() {
        let client = start().await;
        assert_eq!(client.register_cluster("taken").await.unwrap(), "c-taken");
    }

    #[tokio::test]
    async fn test_registration_manifest_follows_token_url() {
        let client = start().await;
        let manifest = client.registration_manifest("c-new01").await.unwrap();
        assert!(manifest.contains("cattle-credentials-1"));
    }

    #[tokio::test]
    async fn test_list_cluster_ids() {
        let client = start().await;
        let ids = client.list_cluster_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("c-new01"));
    }

    #[tokio::test]
    async fn test_bad_token_is_not_transient() {
        let mut client = start().await;
        client.token = "wrong".to_string();
        let err = client.register_cluster("alpha").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Controller { status: Some(401), .. }));
        assert!(!err.is_transient());
    }
}
