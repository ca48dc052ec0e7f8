use crate::control_plane::{ControlPlane, CLUSTER_LABEL};
use crate::controller_client::ControllerApi;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use fleetsim_tunnel::manager::CONNECT_PATH;
use fleetsim_tunnel::session::TUNNEL_ID_HEADER;
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// (kind, namespace, name); namespace is empty for cluster-scoped objects
type ObjectKey = (String, String, String);

#[derive(Debug, Default)]
struct PlaneState {
    provisioned: bool,
    running: bool,
    fail_ensure: bool,
    ensure_calls: u32,
    apply_calls: u32,
    objects: BTreeMap<ObjectKey, serde_yaml::Value>,
    node_status: HashMap<String, serde_json::Value>,
    deleted_namespaces: Vec<String>,
    /// Secret lookups that still come back empty
    secret_delay: u32,
    withhold_secrets: bool,
}

/// In-memory shared control plane for testing
///
/// Applied manifests are parsed and kept as objects keyed by kind,
/// namespace and name, so re-applying is idempotent like `kubectl apply`.
/// Namespaced objects require their namespace to exist.
#[derive(Clone)]
pub struct MockControlPlane {
    state: Arc<RwLock<PlaneState>>,
    api_url: String,
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::with_api_url("http://127.0.0.1:9")
    }

    /// Mock whose proxies forward to `api_url`
    pub fn with_api_url(api_url: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(PlaneState::default())),
            api_url: api_url.into(),
        }
    }

    /// Pretend the control plane already exists and runs
    pub async fn set_running(&self) {
        let mut state = self.state.write().await;
        state.provisioned = true;
        state.running = true;
    }

    pub async fn set_fail_ensure(&self, fail: bool) {
        self.state.write().await.fail_ensure = fail;
    }

    pub async fn set_secret_delay(&self, polls: u32) {
        self.state.write().await.secret_delay = polls;
    }

    pub async fn set_withhold_secrets(&self, withhold: bool) {
        self.state.write().await.withhold_secrets = withhold;
    }

    pub async fn ensure_calls(&self) -> u32 {
        self.state.read().await.ensure_calls
    }

    pub async fn apply_calls(&self) -> u32 {
        self.state.read().await.apply_calls
    }

    pub async fn count(&self, kind: &str) -> usize {
        self.state
            .read()
            .await
            .objects
            .keys()
            .filter(|(k, _, _)| k == kind)
            .count()
    }

    pub async fn object_names(&self, kind: &str, namespace: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .objects
            .keys()
            .filter(|(k, ns, _)| k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub async fn node_status(&self, node: &str) -> Option<serde_json::Value> {
        self.state.read().await.node_status.get(node).cloned()
    }

    pub async fn deleted_namespaces(&self) -> Vec<String> {
        self.state.read().await.deleted_namespaces.clone()
    }

    fn require_running(state: &PlaneState) -> Result<()> {
        if !state.running {
            return Err(RuntimeError::control_plane("mock control plane is not running"));
        }
        Ok(())
    }
}

fn field<'a>(doc: &'a serde_yaml::Value, path: &[&str]) -> Option<&'a str> {
    let mut current = doc;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str()
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    fn api_url(&self) -> String {
        self.api_url.clone()
    }

    async fn is_provisioned(&self) -> Result<bool> {
        Ok(self.state.read().await.provisioned)
    }

    async fn ensure_running(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_calls += 1;
        if state.fail_ensure {
            return Err(RuntimeError::control_plane("mock control plane refused to start"));
        }
        state.provisioned = true;
        state.running = true;
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let state = self.state.read().await;
        Self::require_running(&state)?;
        Ok(state.objects.contains_key(&(
            "Namespace".to_string(),
            String::new(),
            namespace.to_string(),
        )))
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::require_running(&state)?;
        state.apply_calls += 1;

        for document in serde_yaml::Deserializer::from_str(manifest) {
            let doc = serde_yaml::Value::deserialize(document)
                .map_err(|e| RuntimeError::command_failed("kubectl apply", 1, e.to_string()))?;
            if doc.is_null() {
                continue;
            }
            let kind = field(&doc, &["kind"]).unwrap_or_default().to_string();
            let name = field(&doc, &["metadata", "name"]).unwrap_or_default().to_string();
            let namespace = field(&doc, &["metadata", "namespace"])
                .unwrap_or_default()
                .to_string();
            if kind.is_empty() || name.is_empty() {
                return Err(RuntimeError::command_failed(
                    "kubectl apply",
                    1,
                    "object is missing kind or name",
                ));
            }
            if !namespace.is_empty()
                && !state.objects.contains_key(&(
                    "Namespace".to_string(),
                    String::new(),
                    namespace.clone(),
                ))
            {
                return Err(RuntimeError::command_failed(
                    "kubectl apply",
                    1,
                    format!("namespaces \"{}\" not found", namespace),
                ));
            }
            debug!("Mock: applied {} {}/{}", kind, namespace, name);
            state.objects.insert((kind, namespace, name), doc);
        }
        Ok(())
    }

    async fn patch_node_status(&self, node: &str, patch: &serde_json::Value) -> Result<()> {
        let mut state = self.state.write().await;
        Self::require_running(&state)?;
        let key = ("Node".to_string(), String::new(), node.to_string());
        if !state.objects.contains_key(&key) {
            return Err(RuntimeError::command_failed(
                "kubectl patch node",
                1,
                format!("nodes \"{}\" not found", node),
            ));
        }
        state.node_status.insert(node.to_string(), patch.clone());
        Ok(())
    }

    async fn find_secret_tokens(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<Vec<(String, String)>> {
        let mut state = self.state.write().await;
        Self::require_running(&state)?;
        if state.withhold_secrets {
            return Ok(Vec::new());
        }
        if state.secret_delay > 0 {
            state.secret_delay -= 1;
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for ((kind, ns, name), doc) in &state.objects {
            if kind != "Secret" || ns != namespace || !name.starts_with(prefix) {
                continue;
            }
            let secret: Secret = match serde_yaml::from_value(doc.clone()) {
                Ok(secret) => secret,
                Err(_) => continue,
            };
            let token = secret
                .data
                .as_ref()
                .and_then(|d| d.get("token"))
                .and_then(|b| String::from_utf8(b.0.clone()).ok())
                .or_else(|| secret.string_data.as_ref().and_then(|d| d.get("token")).cloned());
            if let Some(token) = token {
                found.push((name.clone(), token));
            }
        }
        Ok(found)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::require_running(&state)?;
        state
            .objects
            .retain(|(kind, ns, name), _| ns != namespace && !(kind == "Namespace" && name == namespace));
        state.deleted_namespaces.push(namespace.to_string());
        Ok(())
    }

    async fn delete_nodes(&self, cluster: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::require_running(&state)?;
        let PlaneState {
            objects,
            node_status,
            ..
        } = &mut *state;
        objects.retain(|(kind, _, name), doc| {
            let owned = kind == "Node"
                && field(doc, &["metadata", "labels", CLUSTER_LABEL]) == Some(cluster);
            if owned {
                node_status.remove(name);
            }
            !owned
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    /// name -> controller ID
    clusters: BTreeMap<String, String>,
    next_id: u32,
    generations: HashMap<String, u32>,
    valid_tokens: HashSet<String>,
    list_fails: bool,
    list_delay: Duration,
    manifest_calls: u32,
    /// tunnel id -> accepted connections
    connections: HashMap<String, u32>,
    /// tunnel id -> kill switches of open sockets
    live: HashMap<String, Vec<CancellationToken>>,
}

/// In-memory controller for testing
///
/// Issues a fresh credential with every registration manifest and can
/// serve the tunnel endpoint, accepting cluster-agent sessions that present
/// a currently valid credential and steve-proxy sessions that present the
/// synthetic identifier of a registered cluster.
#[derive(Clone, Default)]
pub struct MockController {
    state: Arc<parking_lot::Mutex<ControllerState>>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_id(&self, name: &str) -> Option<String> {
        self.state.lock().clusters.get(name).cloned()
    }

    /// Forget a cluster, as if deleted in the controller UI
    pub fn remove_cluster(&self, name: &str) -> Option<String> {
        self.state.lock().clusters.remove(name)
    }

    pub fn set_list_fails(&self, fails: bool) {
        self.state.lock().list_fails = fails;
    }

    /// Make every cluster listing take `delay`
    pub fn set_list_delay(&self, delay: Duration) {
        self.state.lock().list_delay = delay;
    }

    pub fn manifest_calls(&self) -> u32 {
        self.state.lock().manifest_calls
    }

    /// Connections accepted for `"<cluster>:<kind>"`
    pub fn connections(&self, tunnel_id: &str) -> u32 {
        self.state
            .lock()
            .connections
            .get(tunnel_id)
            .copied()
            .unwrap_or(0)
    }

    /// Invalidate every credential issued so far and drop open tunnels of
    /// `cluster`
    pub fn revoke_credentials(&self, cluster: &str) {
        let mut state = self.state.lock();
        state.valid_tokens.clear();
        let prefix = format!("{}:", cluster);
        for (id, kills) in state.live.iter_mut() {
            if id.starts_with(&prefix) {
                for kill in kills.drain(..) {
                    kill.cancel();
                }
            }
        }
    }

    /// Serve the tunnel endpoint on an ephemeral port; returns its base URL
    pub async fn serve_tunnels(&self) -> Result<String> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::internal_error(format!("mock controller bind: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::internal_error(format!("mock controller addr: {}", e)))?;
        let app = Router::new()
            .route(CONNECT_PATH, get(tunnel_handler))
            .with_state(self.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(format!("http://{}", addr))
    }

    fn accepts(&self, tunnel_id: &str, bearer: &str) -> bool {
        let state = self.state.lock();
        if tunnel_id.ends_with(":steve-proxy") {
            return bearer
                .strip_prefix("stv-")
                .map(|id| state.clusters.values().any(|known| known == id))
                .unwrap_or(false);
        }
        state.valid_tokens.contains(bearer)
    }
}

async fn tunnel_handler(
    State(ctl): State<MockController>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let tunnel_id = headers
        .get(TUNNEL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    if !ctl.accepts(&tunnel_id, bearer) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let kill = CancellationToken::new();
    {
        let mut state = ctl.state.lock();
        *state.connections.entry(tunnel_id.clone()).or_insert(0) += 1;
        state
            .live
            .entry(tunnel_id.clone())
            .or_default()
            .push(kill.clone());
    }
    ws.on_upgrade(move |socket| hold_tunnel(socket, kill))
}

async fn hold_tunnel(mut socket: WebSocket, kill: CancellationToken) {
    loop {
        tokio::select! {
            _ = kill.cancelled() => break,
            message = socket.recv() => match message {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

#[async_trait]
impl ControllerApi for MockController {
    async fn register_cluster(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(id) = state.clusters.get(name) {
            return Ok(id.clone());
        }
        state.next_id += 1;
        let id = format!("c-{:05}", state.next_id);
        state.clusters.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn registration_manifest(&self, cluster_id: &str) -> Result<String> {
        let mut state = self.state.lock();
        if !state.clusters.values().any(|id| id == cluster_id) {
            return Err(RuntimeError::controller(
                format!("cluster {} not found", cluster_id),
                Some(404),
            ));
        }
        state.manifest_calls += 1;
        let generation = {
            let g = state.generations.entry(cluster_id.to_string()).or_insert(0);
            *g += 1;
            *g
        };
        let token = format!("token-{}-{}", cluster_id, generation);
        state.valid_tokens.insert(token.clone());

        Ok(format!(
            r#"apiVersion: v1
kind: Namespace
metadata:
  name: cattle-system
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: cattle
  namespace: cattle-system
---
apiVersion: v1
kind: Secret
metadata:
  name: cattle-credentials-{generation}
  namespace: cattle-system
type: Opaque
stringData:
  token: {token}
  url: https://controller.invalid
"#
        ))
    }

    async fn list_cluster_ids(&self) -> Result<HashSet<String>> {
        let delay = self.state.lock().list_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        if state.list_fails {
            return Err(RuntimeError::controller("mock controller unavailable", Some(503)));
        }
        Ok(state.clusters.values().cloned().collect())
    }
}
