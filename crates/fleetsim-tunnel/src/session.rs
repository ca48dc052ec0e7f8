//! One supervised tunnel session per (cluster, kind)
//!
//! A session dials the controller, authenticates with the cluster
//! credential and then serves dial requests until it is cancelled. Lost
//! transports are redialed through the shared [`ReconnectThrottle`]; a
//! rejected credential parks the session until a new one is supplied.

use crate::dial::{pump_stream, DialPolicy};
use crate::error::{Result, TunnelError};
use crate::frame::{Frame, FrameKind};
use crate::manager::TunnelConfig;
use crate::throttle::{Backoff, ReconnectThrottle};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fleetsim_core::TunnelKind;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header naming the tunnel as `<cluster>:<kind>`
pub const TUNNEL_ID_HEADER: &str = "x-tunnel-id";

const OUTBOUND_BUFFER: usize = 256;
const STREAM_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound side of one open stream
struct StreamHandle {
    tx: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

/// Connection phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Connecting,
    Connected,
    Disconnected,
    AuthRejected,
    Stopped,
}

/// Observable state of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub kind: TunnelKind,
    pub phase: SessionPhase,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip)]
    auth_status: Option<u16>,
}

impl SessionState {
    fn new(kind: TunnelKind) -> Self {
        Self {
            kind,
            phase: SessionPhase::Connecting,
            last_connected: None,
            last_attempt: None,
            consecutive_failures: 0,
            last_error: None,
            auth_status: None,
        }
    }
}

/// Cheap handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cluster: String,
    kind: TunnelKind,
    policy: DialPolicy,
    token: CancellationToken,
    state_tx: Arc<watch::Sender<SessionState>>,
    credential_tx: Arc<watch::Sender<String>>,
}

impl SessionHandle {
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    pub fn policy(&self) -> &DialPolicy {
        &self.policy
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// True until the session is cancelled
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Hand the session a new credential. A session parked on a rejected
    /// credential retries immediately; a connected one uses it on its next
    /// reconnect.
    pub fn set_credential(&self, credential: &str) {
        let replaced = self.credential_tx.send_if_modified(|current| {
            if current == credential {
                return false;
            }
            *current = credential.to_string();
            true
        });
        if replaced {
            // Waiters must not observe the old rejection
            self.state_tx.send_if_modified(|s| {
                if s.phase != SessionPhase::AuthRejected {
                    return false;
                }
                s.phase = SessionPhase::Connecting;
                s.auth_status = None;
                true
            });
        }
    }

    /// Wait until the session is connected.
    ///
    /// Fails with `AuthRejected` as soon as the controller refuses the
    /// credential and with `Stopped` if the session is cancelled.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let wait = async {
            loop {
                let (phase, auth_status) = {
                    let state = rx.borrow_and_update();
                    (state.phase, state.auth_status)
                };
                match phase {
                    SessionPhase::Connected => return Ok(()),
                    SessionPhase::AuthRejected => {
                        return Err(TunnelError::auth_rejected(
                            &self.cluster,
                            self.kind.as_str(),
                            auth_status.unwrap_or(StatusCode::UNAUTHORIZED.as_u16()),
                        ))
                    }
                    SessionPhase::Stopped => {
                        return Err(TunnelError::stopped(&self.cluster, self.kind.as_str()))
                    }
                    SessionPhase::Connecting | SessionPhase::Disconnected => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TunnelError::stopped(&self.cluster, self.kind.as_str()));
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            TunnelError::timeout(
                format!("{} tunnel for {} to connect", self.kind, self.cluster),
                timeout.as_secs(),
            )
        })?
    }

    /// Resolve when the controller rejects the credential (`true`) or the
    /// session stops (`false`)
    pub async fn rejected(&self) -> bool {
        let mut rx = self.state_tx.subscribe();
        loop {
            let phase = rx.borrow_and_update().phase;
            match phase {
                SessionPhase::AuthRejected => return true,
                SessionPhase::Stopped => return false,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Resolve once the session task has exited
    pub async fn stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        while rx.borrow_and_update().phase != SessionPhase::Stopped {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawn the supervisor task for one session
pub(crate) fn spawn_session(
    cluster: &str,
    kind: TunnelKind,
    credential: String,
    policy: DialPolicy,
    config: Arc<TunnelConfig>,
    throttle: Arc<ReconnectThrottle>,
    token: CancellationToken,
) -> SessionHandle {
    let state_tx = Arc::new(watch::Sender::new(SessionState::new(kind)));
    let (credential_tx, credential_rx) = watch::channel(credential);

    let task = SessionTask {
        cluster: cluster.to_string(),
        kind,
        policy: policy.clone(),
        backoff: Backoff::new(config.min_reconnect_interval, config.backoff_max),
        config,
        throttle,
        token: token.clone(),
        state_tx: state_tx.clone(),
        credential_rx,
    };
    tokio::spawn(task.run());

    SessionHandle {
        cluster: cluster.to_string(),
        kind,
        policy,
        token,
        state_tx,
        credential_tx: Arc::new(credential_tx),
    }
}

enum SessionExit {
    Cancelled,
    Lost(String),
}

struct SessionTask {
    cluster: String,
    kind: TunnelKind,
    policy: DialPolicy,
    backoff: Backoff,
    config: Arc<TunnelConfig>,
    throttle: Arc<ReconnectThrottle>,
    token: CancellationToken,
    state_tx: Arc<watch::Sender<SessionState>>,
    credential_rx: watch::Receiver<String>,
}

impl SessionTask {
    fn update(&self, f: impl FnOnce(&mut SessionState)) {
        self.state_tx.send_modify(f);
    }

    async fn run(mut self) {
        let mut failures = 0u32;

        loop {
            let extra = self.backoff.delay(failures);
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = self.throttle.wait_turn(&self.cluster, self.kind, extra) => {}
            }

            self.update(|s| {
                s.phase = SessionPhase::Connecting;
                s.last_attempt = Some(Utc::now());
            });
            let credential = self.credential_rx.borrow_and_update().clone();

            let attempt = tokio::select! {
                _ = self.token.cancelled() => break,
                attempt = self.handshake(&credential) => attempt,
            };

            match attempt {
                Ok(ws) => {
                    failures = 0;
                    self.update(|s| {
                        s.phase = SessionPhase::Connected;
                        s.last_connected = Some(Utc::now());
                        s.consecutive_failures = 0;
                        s.last_error = None;
                        s.auth_status = None;
                    });
                    info!(cluster = %self.cluster, kind = %self.kind, "Tunnel connected");

                    match self.serve(ws).await {
                        SessionExit::Cancelled => break,
                        SessionExit::Lost(reason) => {
                            warn!(cluster = %self.cluster, kind = %self.kind, "Tunnel lost: {}", reason);
                            failures = 1;
                            self.update(|s| {
                                s.phase = SessionPhase::Disconnected;
                                s.consecutive_failures = 1;
                                s.last_error = Some(reason);
                            });
                        }
                    }
                }
                Err(TunnelError::AuthRejected { status, .. }) => {
                    warn!(
                        cluster = %self.cluster,
                        kind = %self.kind,
                        status,
                        "Controller rejected tunnel credential"
                    );
                    self.update(|s| {
                        s.phase = SessionPhase::AuthRejected;
                        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                        s.last_error = Some(format!("credential rejected (HTTP {})", status));
                        s.auth_status = Some(status);
                    });

                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        changed = self.credential_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    info!(cluster = %self.cluster, kind = %self.kind, "Credential replaced, redialing");
                    failures = 0;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    debug!(
                        cluster = %self.cluster,
                        kind = %self.kind,
                        failures,
                        "Tunnel dial failed: {}",
                        e
                    );
                    self.update(|s| {
                        s.phase = SessionPhase::Disconnected;
                        s.consecutive_failures = failures;
                        s.last_error = Some(e.to_string());
                    });
                }
            }
        }

        self.update(|s| s.phase = SessionPhase::Stopped);
        info!(cluster = %self.cluster, kind = %self.kind, "Tunnel session stopped");
    }

    async fn handshake(&self, credential: &str) -> Result<WsStream> {
        let mut request = self.config.connect_url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            HeaderName::from_static(TUNNEL_ID_HEADER),
            header_value(&format!("{}:{}", self.cluster, self.kind))?,
        );
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", credential))?);

        let limit = self.config.handshake_timeout;
        match tokio::time::timeout(limit, connect_async(request)).await {
            Err(_) => Err(TunnelError::timeout("tunnel handshake", limit.as_secs())),
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(WsError::Http(response)))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                Err(TunnelError::auth_rejected(
                    &self.cluster,
                    self.kind.as_str(),
                    response.status().as_u16(),
                ))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Pump frames until the transport dies or the session is cancelled
    async fn serve(&self, ws: WsStream) -> SessionExit {
        let (mut sink, mut source) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
        let mut streams: HashMap<u64, StreamHandle> = HashMap::new();
        let streams_token = self.token.child_token();
        let mut next_message_id = 1u64;

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;
        let mut last_seen = Instant::now();

        let exit = loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break SessionExit::Cancelled;
                }
                _ = keepalive.tick() => {
                    if last_seen.elapsed() > self.config.keepalive_grace {
                        break SessionExit::Lost("no traffic within keepalive grace window".to_string());
                    }
                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        break SessionExit::Lost(e.to_string());
                    }
                    let frame = stamp(&mut next_message_id, Frame::keepalive());
                    if let Err(e) = sink.send(frame).await {
                        break SessionExit::Lost(e.to_string());
                    }
                }
                Some(frame) = out_rx.recv() => {
                    if matches!(frame.kind, FrameKind::Close | FrameKind::Error) {
                        streams.remove(&frame.stream_id);
                    }
                    let message = stamp(&mut next_message_id, frame);
                    if let Err(e) = sink.send(message).await {
                        break SessionExit::Lost(e.to_string());
                    }
                }
                message = source.next() => match message {
                    None => break SessionExit::Lost("controller closed the connection".to_string()),
                    Some(Err(e)) => break SessionExit::Lost(e.to_string()),
                    Some(Ok(Message::Close(_))) => {
                        break SessionExit::Lost("controller sent close".to_string())
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        let frame = match Frame::decode(data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(cluster = %self.cluster, kind = %self.kind, "Dropping frame: {}", e);
                                continue;
                            }
                        };
                        if let Some(reply) = self.handle_frame(frame, &mut streams, &out_tx, &streams_token) {
                            if let Err(e) = sink.send(stamp(&mut next_message_id, reply)).await {
                                break SessionExit::Lost(e.to_string());
                            }
                        }
                    }
                    Some(Ok(_)) => last_seen = Instant::now(),
                },
            }
        };

        streams_token.cancel();
        exit
    }

    /// Apply one inbound frame, returning an immediate reply if any
    ///
    /// Never waits on a stream: a stream whose local side cannot keep up is
    /// closed with an `Error` frame so the rest of the session keeps moving.
    fn handle_frame(
        &self,
        frame: Frame,
        streams: &mut HashMap<u64, StreamHandle>,
        out_tx: &mpsc::Sender<Frame>,
        streams_token: &CancellationToken,
    ) -> Option<Frame> {
        let stream_id = frame.stream_id;
        match frame.kind {
            FrameKind::Connect => {
                let (proto, address) = match frame.connect_target() {
                    Ok(target) => target,
                    Err(e) => return Some(Frame::error(stream_id, e.to_string())),
                };
                if !self.policy.permits(&proto, &address) {
                    warn!(cluster = %self.cluster, kind = %self.kind, %address, "Refusing dial");
                    let err = TunnelError::dial_refused(&address, self.kind.as_str());
                    return Some(Frame::error(stream_id, err.to_string()));
                }
                if streams.contains_key(&stream_id) {
                    return Some(Frame::error(stream_id, "stream already open"));
                }

                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                let token = streams_token.child_token();
                streams.insert(
                    stream_id,
                    StreamHandle {
                        tx,
                        token: token.clone(),
                    },
                );
                tokio::spawn(pump_stream(
                    stream_id,
                    address,
                    rx,
                    out_tx.clone(),
                    self.config.dial_timeout,
                    token,
                ));
                None
            }
            FrameKind::Data => {
                let Some(stream) = streams.get(&stream_id) else {
                    debug!(stream_id, "Data for unknown stream");
                    return None;
                };
                match stream.tx.try_send(frame.payload) {
                    Ok(()) => None,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            cluster = %self.cluster,
                            kind = %self.kind,
                            stream_id,
                            "Local side is not draining stream, closing it"
                        );
                        if let Some(stream) = streams.remove(&stream_id) {
                            stream.token.cancel();
                        }
                        Some(Frame::error(stream_id, "stream receive buffer full"))
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        streams.remove(&stream_id);
                        None
                    }
                }
            }
            FrameKind::Close | FrameKind::Error => {
                // Dropping the sender lets the pump finish and shut down
                streams.remove(&stream_id);
                None
            }
            FrameKind::Keepalive => None,
        }
    }
}

fn stamp(next_message_id: &mut u64, frame: Frame) -> Message {
    let frame = frame.with_message_id(*next_message_id);
    *next_message_id += 1;
    Message::Binary(frame.encode())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| TunnelError::protocol("credential or tunnel id is not a valid header value"))
}
