use crate::dial::DialPolicy;
use crate::session::{spawn_session, SessionHandle, SessionState};
use crate::throttle::ReconnectThrottle;
use fleetsim_core::TunnelKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Path of the tunnel endpoint on the controller
pub const CONNECT_PATH: &str = "/v3/connect";

/// Tunnel manager configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Websocket URL of the controller's tunnel endpoint
    pub connect_url: String,
    /// Minimum gap between two dials of the same (cluster, kind)
    pub min_reconnect_interval: Duration,
    /// Upper bound of the exponential backoff
    pub backoff_max: Duration,
    pub keepalive_interval: Duration,
    /// A session with no inbound traffic for this long is redialed
    pub keepalive_grace: Duration,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_url: format!("wss://localhost{}", CONNECT_PATH),
            min_reconnect_interval: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_grace: Duration::from_secs(45),
            handshake_timeout: Duration::from_secs(15),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl TunnelConfig {
    /// Defaults pointed at the controller's base URL
    pub fn for_controller(controller_url: &str) -> Self {
        Self {
            connect_url: connect_url(controller_url),
            ..Self::default()
        }
    }
}

/// Derive the websocket tunnel URL from the controller's HTTP(S) URL
pub fn connect_url(controller_url: &str) -> String {
    let base = controller_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}{}", base, CONNECT_PATH)
}

/// Owns every tunnel session of the process
pub struct TunnelManager {
    config: Arc<TunnelConfig>,
    throttle: Arc<ReconnectThrottle>,
    sessions: Mutex<HashMap<(String, TunnelKind), SessionHandle>>,
    token: CancellationToken,
}

impl TunnelManager {
    /// Sessions are children of `token`; cancelling it stops them all
    pub fn new(config: TunnelConfig, token: CancellationToken) -> Self {
        let throttle = Arc::new(ReconnectThrottle::new(config.min_reconnect_interval));
        Self {
            config: Arc::new(config),
            throttle,
            sessions: Mutex::new(HashMap::new()),
            token,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Start (or reuse) the session for `(cluster, kind)`.
    ///
    /// A live session with the same dial policy is returned as-is after
    /// taking the credential, so repeated calls never open a second
    /// connection. A changed policy replaces the session.
    pub fn connect(
        &self,
        cluster: &str,
        kind: TunnelKind,
        credential: &str,
        policy: DialPolicy,
    ) -> SessionHandle {
        let key = (cluster.to_string(), kind);
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(&key) {
            if existing.is_live() && *existing.policy() == policy {
                debug!(cluster, %kind, "Reusing live tunnel session");
                existing.set_credential(credential);
                return existing.clone();
            }
            existing.cancel();
        }

        let handle = spawn_session(
            cluster,
            kind,
            credential.to_string(),
            policy,
            self.config.clone(),
            self.throttle.clone(),
            self.token.child_token(),
        );
        info!(cluster, %kind, url = %self.config.connect_url, "Started tunnel session");
        sessions.insert(key, handle.clone());
        handle
    }

    /// Hand a live session a new credential
    pub fn update_credential(&self, cluster: &str, kind: TunnelKind, credential: &str) -> bool {
        match self.sessions.lock().get(&(cluster.to_string(), kind)) {
            Some(handle) if handle.is_live() => {
                handle.set_credential(credential);
                true
            }
            _ => false,
        }
    }

    pub fn session(&self, cluster: &str, kind: TunnelKind) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .get(&(cluster.to_string(), kind))
            .cloned()
    }

    /// Session states of `cluster`, ordered by kind
    pub fn states(&self, cluster: &str) -> Vec<SessionState> {
        let sessions = self.sessions.lock();
        TunnelKind::ALL
            .iter()
            .filter_map(|kind| sessions.get(&(cluster.to_string(), *kind)))
            .map(|handle| handle.state())
            .collect()
    }

    /// Cancel and forget both sessions of `cluster`, including their
    /// reconnect history
    pub fn disconnect(&self, cluster: &str) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.lock();
        let mut removed = Vec::new();
        for kind in TunnelKind::ALL {
            if let Some(handle) = sessions.remove(&(cluster.to_string(), kind)) {
                handle.cancel();
                removed.push(handle);
            }
        }
        self.throttle.forget(cluster);
        if !removed.is_empty() {
            info!(cluster, sessions = removed.len(), "Disconnected tunnel sessions");
        }
        removed
    }

    /// Number of sessions not yet cancelled
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|handle| handle.is_live())
            .count()
    }

    /// Cancel every session
    pub fn shutdown(&self) {
        let sessions = self.sessions.lock();
        for handle in sessions.values() {
            handle.cancel();
        }
        info!(sessions = sessions.len(), "Tunnel manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameKind};
    use crate::session::{SessionPhase, TUNNEL_ID_HEADER};
    use crate::TunnelError;
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    /// Stand-in controller accepting one bearer token
    #[derive(Clone)]
    struct Controller {
        token: Arc<Mutex<String>>,
        sockets: mpsc::UnboundedSender<(String, WebSocket)>,
    }

    async fn connect_handler(
        State(ctl): State<Controller>,
        headers: HeaderMap,
        ws: WebSocketUpgrade,
    ) -> Response {
        let expected = format!("Bearer {}", ctl.token.lock());
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let id = headers
            .get(TUNNEL_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        ws.on_upgrade(move |socket| async move {
            let _ = ctl.sockets.send((id, socket));
        })
        .into_response()
    }

    async fn start_controller(
        token: &str,
    ) -> (String, Controller, mpsc::UnboundedReceiver<(String, WebSocket)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctl = Controller {
            token: Arc::new(Mutex::new(token.to_string())),
            sockets: tx,
        };
        let app = Router::new()
            .route(CONNECT_PATH, get(connect_handler))
            .with_state(ctl.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), ctl, rx)
    }

    fn test_config(controller_url: &str) -> TunnelConfig {
        TunnelConfig {
            min_reconnect_interval: Duration::from_millis(50),
            backoff_max: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(1),
            keepalive_grace: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(2),
            ..TunnelConfig::for_controller(controller_url)
        }
    }

    fn test_manager(controller_url: &str) -> TunnelManager {
        TunnelManager::new(test_config(controller_url), CancellationToken::new())
    }

    async fn next_socket(rx: &mut mpsc::UnboundedReceiver<(String, WebSocket)>) -> (String, WebSocket) {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("controller saw no connection")
            .expect("controller channel closed")
    }

    /// Next frame of any kind, keepalives included
    async fn next_raw_frame(socket: &mut WebSocket) -> Frame {
        loop {
            let message = tokio::time::timeout(WAIT, socket.recv())
                .await
                .expect("no frame from session");
            match message {
                Some(Ok(Message::Binary(data))) => return Frame::decode(data).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other.map(|m| m.is_ok())),
            }
        }
    }

    async fn next_frame(socket: &mut WebSocket) -> Frame {
        loop {
            let frame = next_raw_frame(socket).await;
            if frame.kind != FrameKind::Keepalive {
                return frame;
            }
        }
    }

    /// Accepts one connection and never reads from it
    async fn start_stalled_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        addr
    }

    async fn start_echo_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });
        addr
    }

    async fn send_frame(socket: &mut WebSocket, frame: Frame) {
        socket.send(Message::Binary(frame.encode())).await.unwrap();
    }

    #[test]
    fn test_connect_url_from_controller_url() {
        assert_eq!(
            connect_url("https://rancher.example.com/"),
            "wss://rancher.example.com/v3/connect"
        );
        assert_eq!(connect_url("http://127.0.0.1:8080"), "ws://127.0.0.1:8080/v3/connect");
    }

    #[tokio::test]
    async fn test_session_connects_with_tunnel_identity() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let manager = test_manager(&url);

        let handle = manager.connect("alpha", TunnelKind::ClusterAgent, "good", DialPolicy::Any);
        handle.wait_connected(WAIT).await.unwrap();

        let (id, _socket) = next_socket(&mut sockets).await;
        assert_eq!(id, "alpha:cluster-agent");

        let states = manager.states("alpha");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].phase, SessionPhase::Connected);
        assert!(states[0].last_connected.is_some());
        assert_eq!(states[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_rejected_credential_waits_for_rotation() {
        let (url, _ctl, mut sockets) = start_controller("fresh").await;
        let manager = test_manager(&url);

        let handle = manager.connect("alpha", TunnelKind::ClusterAgent, "stale", DialPolicy::Any);
        let err = handle.wait_connected(WAIT).await.unwrap_err();
        assert!(matches!(err, TunnelError::AuthRejected { status: 401, .. }));
        assert!(handle.rejected().await);
        assert_eq!(handle.state().phase, SessionPhase::AuthRejected);

        assert!(manager.update_credential("alpha", TunnelKind::ClusterAgent, "fresh"));
        assert!(!manager.update_credential("alpha", TunnelKind::SteveProxy, "fresh"));
        handle.wait_connected(WAIT).await.unwrap();
        let (id, _socket) = next_socket(&mut sockets).await;
        assert_eq!(id, "alpha:cluster-agent");
    }

    #[tokio::test]
    async fn test_repeated_connect_reuses_live_session() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let manager = test_manager(&url);

        let first = manager.connect("alpha", TunnelKind::SteveProxy, "good", DialPolicy::Any);
        first.wait_connected(WAIT).await.unwrap();
        let _socket = next_socket(&mut sockets).await;

        let second = manager.connect("alpha", TunnelKind::SteveProxy, "good", DialPolicy::Any);
        second.wait_connected(WAIT).await.unwrap();
        assert_eq!(manager.active_sessions(), 1);

        let extra = tokio::time::timeout(Duration::from_millis(300), sockets.recv()).await;
        assert!(extra.is_err(), "a second connection was opened");
    }

    #[tokio::test]
    async fn test_controller_dial_reaches_local_endpoint() {
        let echo_addr = start_echo_endpoint().await;

        let (url, _ctl, mut sockets) = start_controller("good").await;
        let manager = test_manager(&url);
        let handle = manager.connect("alpha", TunnelKind::ClusterAgent, "good", DialPolicy::Any);
        handle.wait_connected(WAIT).await.unwrap();
        let (_, mut socket) = next_socket(&mut sockets).await;

        send_frame(&mut socket, Frame::connect(1, "tcp", &echo_addr)).await;
        send_frame(&mut socket, Frame::data(1, bytes::Bytes::from_static(b"hello"))).await;

        let reply = next_frame(&mut socket).await;
        assert_eq!(reply.kind, FrameKind::Data);
        assert_eq!(reply.stream_id, 1);
        assert_eq!(&reply.payload[..], b"hello");

        let closed = next_frame(&mut socket).await;
        assert_eq!(closed.kind, FrameKind::Close);
        assert_eq!(closed.stream_id, 1);
    }

    #[tokio::test]
    async fn test_steve_proxy_refuses_unlisted_address() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let manager = test_manager(&url);
        let policy = DialPolicy::for_kind(TunnelKind::SteveProxy, 8440, "127.0.0.1:9796");
        let handle = manager.connect("alpha", TunnelKind::SteveProxy, "good", policy);
        handle.wait_connected(WAIT).await.unwrap();
        let (_, mut socket) = next_socket(&mut sockets).await;

        send_frame(&mut socket, Frame::connect(7, "tcp", "10.0.0.9:22")).await;
        let reply = next_frame(&mut socket).await;
        assert_eq!(reply.kind, FrameKind::Error);
        assert_eq!(reply.stream_id, 7);
        assert!(reply.reason().contains("10.0.0.9:22"));

        // The session survives the refusal
        assert_eq!(handle.state().phase, SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_lost_transport_is_redialed() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let manager = test_manager(&url);
        let handle = manager.connect("alpha", TunnelKind::ClusterAgent, "good", DialPolicy::Any);
        handle.wait_connected(WAIT).await.unwrap();

        let (_, socket) = next_socket(&mut sockets).await;
        drop(socket);

        let (id, _socket) = next_socket(&mut sockets).await;
        assert_eq!(id, "alpha:cluster-agent");
        handle.wait_connected(WAIT).await.unwrap();
        assert!(handle.state().last_attempt.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_stops_both_sessions() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let manager = test_manager(&url);
        for kind in TunnelKind::ALL {
            let handle = manager.connect("alpha", kind, "good", DialPolicy::Any);
            handle.wait_connected(WAIT).await.unwrap();
        }
        let _a = next_socket(&mut sockets).await;
        let _b = next_socket(&mut sockets).await;

        let removed = manager.disconnect("alpha");
        assert_eq!(removed.len(), 2);
        for handle in &removed {
            tokio::time::timeout(WAIT, handle.stopped()).await.unwrap();
            assert_eq!(handle.state().phase, SessionPhase::Stopped);
        }
        assert_eq!(manager.active_sessions(), 0);
        assert!(manager.states("alpha").is_empty());
    }

    #[tokio::test]
    async fn test_changed_policy_replaces_session() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let manager = test_manager(&url);
        let old = manager.connect(
            "alpha",
            TunnelKind::SteveProxy,
            "good",
            DialPolicy::for_kind(TunnelKind::SteveProxy, 8440, "127.0.0.1:9796"),
        );
        old.wait_connected(WAIT).await.unwrap();
        let _first = next_socket(&mut sockets).await;

        let new = manager.connect(
            "alpha",
            TunnelKind::SteveProxy,
            "good",
            DialPolicy::for_kind(TunnelKind::SteveProxy, 8441, "127.0.0.1:9796"),
        );
        assert!(!old.is_live());
        new.wait_connected(WAIT).await.unwrap();
        let _second = next_socket(&mut sockets).await;
        assert_eq!(manager.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_stalled_stream_does_not_block_session() {
        let stalled_addr = start_stalled_endpoint().await;
        let echo_addr = start_echo_endpoint().await;

        let (url, _ctl, mut sockets) = start_controller("good").await;
        let manager = test_manager(&url);
        let handle = manager.connect("alpha", TunnelKind::ClusterAgent, "good", DialPolicy::Any);
        handle.wait_connected(WAIT).await.unwrap();
        let (_, mut socket) = next_socket(&mut sockets).await;

        // Far more than the local socket and the stream buffer can hold
        send_frame(&mut socket, Frame::connect(1, "tcp", &stalled_addr)).await;
        let chunk = bytes::Bytes::from(vec![0u8; 256 * 1024]);
        for _ in 0..200 {
            send_frame(&mut socket, Frame::data(1, chunk.clone())).await;
        }

        send_frame(&mut socket, Frame::connect(2, "tcp", &echo_addr)).await;
        send_frame(&mut socket, Frame::data(2, bytes::Bytes::from_static(b"hello"))).await;

        let mut stalled_error = false;
        let echoed = loop {
            let frame = next_frame(&mut socket).await;
            match (frame.stream_id, frame.kind) {
                (1, FrameKind::Error) => stalled_error = true,
                (2, FrameKind::Data) => break frame,
                _ => {}
            }
        };
        assert_eq!(&echoed.payload[..], b"hello");
        assert!(stalled_error, "stalled stream was not closed with an error");
        assert_eq!(handle.state().phase, SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_keepalive_frames_reach_controller() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let config = TunnelConfig {
            keepalive_interval: Duration::from_millis(100),
            ..test_config(&url)
        };
        let manager = TunnelManager::new(config, CancellationToken::new());
        let handle = manager.connect("alpha", TunnelKind::ClusterAgent, "good", DialPolicy::Any);
        handle.wait_connected(WAIT).await.unwrap();
        let (_, mut socket) = next_socket(&mut sockets).await;

        let first = next_raw_frame(&mut socket).await;
        assert_eq!(first.kind, FrameKind::Keepalive);
        assert_eq!(first.stream_id, 0);
        let second = next_raw_frame(&mut socket).await;
        assert_eq!(second.kind, FrameKind::Keepalive);
        assert!(second.message_id > first.message_id);
    }

    #[tokio::test]
    async fn test_silent_controller_is_redialed_after_grace() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let config = TunnelConfig {
            keepalive_interval: Duration::from_millis(100),
            keepalive_grace: Duration::from_millis(300),
            ..test_config(&url)
        };
        let manager = TunnelManager::new(config, CancellationToken::new());
        let handle = manager.connect("alpha", TunnelKind::ClusterAgent, "good", DialPolicy::Any);
        handle.wait_connected(WAIT).await.unwrap();

        // Never read from the first socket, so pings go unanswered
        let started = std::time::Instant::now();
        let (_, _silent) = next_socket(&mut sockets).await;
        let (id, _second) = next_socket(&mut sockets).await;
        assert_eq!(id, "alpha:cluster-agent");
        assert!(started.elapsed() >= Duration::from_millis(300));
        handle.wait_connected(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_clears_reconnect_history() {
        let (url, _ctl, mut sockets) = start_controller("good").await;
        let config = TunnelConfig {
            min_reconnect_interval: Duration::from_secs(10),
            ..test_config(&url)
        };
        let manager = TunnelManager::new(config, CancellationToken::new());
        let first = manager.connect("alpha", TunnelKind::ClusterAgent, "good", DialPolicy::Any);
        first.wait_connected(WAIT).await.unwrap();
        let _first = next_socket(&mut sockets).await;

        manager.disconnect("alpha");

        // Without the reset this dial would sit out the 10s gap
        let second = manager.connect("alpha", TunnelKind::ClusterAgent, "good", DialPolicy::Any);
        second.wait_connected(Duration::from_secs(2)).await.unwrap();
        let (id, _second) = next_socket(&mut sockets).await;
        assert_eq!(id, "alpha:cluster-agent");
    }
}
