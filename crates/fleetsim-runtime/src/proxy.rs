//! Per-cluster loopback reverse proxies to the shared control plane API

use crate::error::{Result, RuntimeError};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Largest request body the proxy buffers
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Proxy supervisor configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// First port handed out
    pub base_port: u16,
    pub max_port: u16,
    pub bind_address: IpAddr,
    /// Extra binds of a cluster's own port before moving to a new one
    pub bind_retries: u32,
    pub retry_delay: Duration,
    /// How long a stopping listener may drain in-flight requests
    pub drain_timeout: Duration,
    /// Limit on opening a connection upstream. Responses themselves are
    /// unbounded so long-lived watches stream through.
    pub connect_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_port: 8440,
            max_port: u16::MAX,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_retries: 2,
            retry_delay: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// cluster -> port allocation table
///
/// Keeps the mapping a bijection: no port is ever held by two clusters.
/// Ports come from a counter that only moves forward, so a freed port is
/// not handed out again until the counter wraps past the top of the range.
#[derive(Debug, Default, Clone)]
pub struct PortTable {
    ports: BTreeMap<String, u16>,
    /// Port after the highest one handed out; `None` before the first
    /// assignment and after wrapping past `u16::MAX`
    next: Option<u16>,
}

impl PortTable {
    /// Rebuild from persisted state, dropping any entry whose port is
    /// already held by an earlier cluster
    pub fn from_persisted(persisted: BTreeMap<String, u16>) -> Self {
        let mut table = Self::default();
        for (cluster, port) in persisted {
            if table.is_held(port) {
                warn!(cluster = %cluster, port, "Dropping duplicate persisted proxy port");
                continue;
            }
            table.assign(&cluster, port);
        }
        table
    }

    pub fn get(&self, cluster: &str) -> Option<u16> {
        self.ports.get(cluster).copied()
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.ports.values().any(|p| *p == port)
    }

    /// First port from the counter onwards, wrapping to `base` at `max`,
    /// that nobody holds and `usable` accepts
    pub fn next_free(&self, base: u16, max: u16, mut usable: impl FnMut(u16) -> bool) -> Option<u16> {
        let held: HashSet<u16> = self.ports.values().copied().collect();
        let start = self.next.unwrap_or(base).max(base).min(max);
        (start..=max)
            .chain(base..start)
            .find(|port| !held.contains(port) && usable(*port))
    }

    /// Hand `port` to `cluster`, moving the counter past it
    pub fn assign(&mut self, cluster: &str, port: u16) {
        self.ports.insert(cluster.to_string(), port);
        if self.next.map_or(true, |next| port >= next) {
            self.next = port.checked_add(1);
        }
    }

    pub fn release(&mut self, cluster: &str) -> Option<u16> {
        self.ports.remove(cluster)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u16> {
        self.ports.clone()
    }
}

struct Shared {
    config: ProxyConfig,
    upstream: Arc<str>,
    client: reqwest::Client,
    ports: Mutex<PortTable>,
    /// Linearizes allocation and binding
    alloc_lock: tokio::sync::Mutex<()>,
    /// Token of each cluster's current listener; cancelling it makes the
    /// supervisor rebind
    incarnations: Mutex<HashMap<String, CancellationToken>>,
    /// Bumped whenever the port table changes
    changes: watch::Sender<u64>,
}

impl Shared {
    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    async fn bind(&self, port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::new(self.config.bind_address, port)).await
    }

    /// Bind the cluster's port, retrying it first and falling back to the
    /// next free one. Caller holds `alloc_lock`.
    async fn bind_for(&self, cluster: &str) -> Result<(u16, TcpListener)> {
        let mut skip = HashSet::new();

        let persisted = self.ports.lock().get(cluster);
        if let Some(port) = persisted {
            for attempt in 0..=self.config.bind_retries {
                match self.bind(port).await {
                    Ok(listener) => return Ok((port, listener)),
                    Err(e) => {
                        warn!(cluster, port, attempt, "Failed to bind proxy port: {}", e);
                        if attempt < self.config.bind_retries {
                            tokio::time::sleep(self.config.retry_delay).await;
                        }
                    }
                }
            }
            skip.insert(port);
        }

        loop {
            let candidate = self.ports.lock().next_free(
                self.config.base_port,
                self.config.max_port,
                |p| !skip.contains(&p),
            );
            let port = candidate.ok_or(RuntimeError::PortExhausted {
                base: self.config.base_port,
                max: self.config.max_port,
            })?;
            match self.bind(port).await {
                Ok(listener) => {
                    let previous = {
                        let mut ports = self.ports.lock();
                        let previous = ports.get(cluster);
                        ports.assign(cluster, port);
                        previous
                    };
                    self.notify();
                    match previous {
                        Some(old) => info!(cluster, port, old_port = old, "Moved proxy to a new port"),
                        None => info!(cluster, port, "Allocated proxy port"),
                    }
                    return Ok((port, listener));
                }
                Err(e) => {
                    debug!(cluster, port, "Port not bindable: {}", e);
                    skip.insert(port);
                }
            }
        }
    }
}

struct Listener {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns every proxy listener and the port allocation table
pub struct ProxySupervisor {
    shared: Arc<Shared>,
    listeners: Mutex<HashMap<String, Listener>>,
    token: CancellationToken,
}

impl ProxySupervisor {
    /// `persisted` is the port table from the last snapshot; listeners are
    /// children of `token`
    pub fn new(
        config: ProxyConfig,
        upstream_url: &str,
        persisted: BTreeMap<String, u16>,
        token: CancellationToken,
    ) -> Result<Self> {
        // The control plane serves a self-signed certificate
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| RuntimeError::internal_error(format!("proxy client: {}", e)))?;

        let (changes, _) = watch::channel(0);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                upstream: Arc::from(upstream_url.trim_end_matches('/')),
                client,
                ports: Mutex::new(PortTable::from_persisted(persisted)),
                alloc_lock: tokio::sync::Mutex::new(()),
                incarnations: Mutex::new(HashMap::new()),
                changes,
            }),
            listeners: Mutex::new(HashMap::new()),
            token,
        })
    }

    /// Start the cluster's listener, or return the port of the running one.
    ///
    /// A persisted port is reused; if it cannot be bound after the
    /// configured retries the next free port is allocated instead.
    pub async fn start_proxy(&self, cluster: &str) -> Result<u16> {
        let _alloc = self.shared.alloc_lock.lock().await;

        if self.is_running(cluster) {
            if let Some(port) = self.port(cluster) {
                debug!(cluster, port, "Proxy already running");
                return Ok(port);
            }
        }

        let (port, listener) = self.shared.bind_for(cluster).await?;
        let stop = self.token.child_token();
        let incarnation = stop.child_token();
        self.shared
            .incarnations
            .lock()
            .insert(cluster.to_string(), incarnation.clone());
        let task = tokio::spawn(supervise(
            self.shared.clone(),
            cluster.to_string(),
            listener,
            stop.clone(),
            incarnation,
        ));

        if let Some(old) = self
            .listeners
            .lock()
            .insert(cluster.to_string(), Listener { stop, task })
        {
            old.stop.cancel();
        }

        info!(cluster, port, upstream = %self.shared.upstream, "Started proxy listener");
        Ok(port)
    }

    /// Stop the listener after draining in-flight requests. The port stays
    /// allocated.
    pub async fn stop_proxy(&self, cluster: &str) {
        let listener = match self.listeners.lock().remove(cluster) {
            Some(listener) => listener,
            None => return,
        };
        self.shared.incarnations.lock().remove(cluster);
        listener.stop.cancel();

        let mut task = listener.task;
        if tokio::time::timeout(self.shared.config.drain_timeout, &mut task)
            .await
            .is_err()
        {
            warn!(cluster, "Proxy did not drain in time, aborting");
            task.abort();
        }
        info!(cluster, "Stopped proxy listener");
    }

    /// Forget the cluster's port so it can be handed out again
    pub fn release_port(&self, cluster: &str) -> Option<u16> {
        let released = self.shared.ports.lock().release(cluster);
        if released.is_some() {
            self.shared.notify();
        }
        released
    }

    pub fn port(&self, cluster: &str) -> Option<u16> {
        self.shared.ports.lock().get(cluster)
    }

    pub fn is_running(&self, cluster: &str) -> bool {
        self.listeners
            .lock()
            .get(cluster)
            .map(|l| !l.task.is_finished())
            .unwrap_or(false)
    }

    pub fn ports_snapshot(&self) -> BTreeMap<String, u16> {
        self.shared.ports.lock().snapshot()
    }

    /// Fires whenever the port table changes, including moves made by the
    /// supervisor after a listener died
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Stop every listener
    pub async fn shutdown(&self) {
        let clusters: Vec<String> = self.listeners.lock().keys().cloned().collect();
        for cluster in clusters {
            self.stop_proxy(&cluster).await;
        }
    }

    /// Kill the current listener without stopping supervision
    #[cfg(test)]
    fn crash(&self, cluster: &str) {
        if let Some(incarnation) = self.shared.incarnations.lock().get(cluster) {
            incarnation.cancel();
        }
    }
}

/// Serve one cluster's proxy until `stop`, rebinding whenever the listener
/// exits on its own
async fn supervise(
    shared: Arc<Shared>,
    cluster: String,
    mut listener: TcpListener,
    stop: CancellationToken,
    mut incarnation: CancellationToken,
) {
    loop {
        let app = forward_router(&shared);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(incarnation.clone().cancelled_owned())
            .await
        {
            error!(cluster = %cluster, "Proxy listener failed: {}", e);
        }
        if stop.is_cancelled() {
            return;
        }

        warn!(cluster = %cluster, "Proxy listener exited, restarting");
        listener = loop {
            let bound = {
                let _alloc = shared.alloc_lock.lock().await;
                shared.bind_for(&cluster).await
            };
            match bound {
                Ok((port, listener)) => {
                    info!(cluster = %cluster, port, "Proxy listener restarted");
                    break listener;
                }
                Err(e) => {
                    error!(cluster = %cluster, "Failed to restart proxy listener: {}", e);
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(shared.config.retry_delay) => {}
                    }
                }
            }
        };
        if stop.is_cancelled() {
            return;
        }
        incarnation = stop.child_token();
        shared
            .incarnations
            .lock()
            .insert(cluster.clone(), incarnation.clone());
    }
}

#[derive(Clone)]
struct Forward {
    client: reqwest::Client,
    upstream: Arc<str>,
}

fn forward_router(shared: &Shared) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(Forward {
            client: shared.client.clone(),
            upstream: shared.upstream.clone(),
        })
        .layer(TraceLayer::new_for_http())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Pass a request through unchanged, except that content-encoding
/// negotiation is dropped so responses stay readable
async fn forward(State(fwd): State<Forward>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", fwd.upstream, path);

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("unreadable request body: {}", e))
                .into_response()
        }
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::ACCEPT_ENCODING);

    let upstream = match fwd
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, "Upstream request failed: {}", e);
            return (StatusCode::BAD_GATEWAY, format!("upstream unavailable: {}", e))
                .into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}
