//! Local dials requested by the controller through a tunnel session

use crate::frame::Frame;
use bytes::Bytes;
use fleetsim_core::TunnelKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK: usize = 32 * 1024;

/// Which local endpoints a session may dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialPolicy {
    /// Any TCP address
    Any,
    /// Only the listed `host:port` addresses
    AllowList(Vec<String>),
}

impl DialPolicy {
    /// Policy for a tunnel kind: steve-proxy is limited to the cluster's
    /// proxy port and the health endpoint
    pub fn for_kind(kind: TunnelKind, proxy_port: u16, health_address: &str) -> Self {
        match kind {
            TunnelKind::ClusterAgent => DialPolicy::Any,
            TunnelKind::SteveProxy => DialPolicy::AllowList(vec![
                normalize(&format!("127.0.0.1:{}", proxy_port)),
                normalize(health_address),
            ]),
        }
    }

    pub fn permits(&self, proto: &str, address: &str) -> bool {
        if proto != "tcp" {
            return false;
        }
        match self {
            DialPolicy::Any => true,
            DialPolicy::AllowList(allowed) => {
                let wanted = normalize(address);
                allowed.iter().any(|a| *a == wanted)
            }
        }
    }
}

/// `localhost` and `127.0.0.1` name the same endpoint
fn normalize(address: &str) -> String {
    match address.rsplit_once(':') {
        Some(("localhost", port)) => format!("127.0.0.1:{}", port),
        _ => address.to_string(),
    }
}

/// Dial `address` and shuttle bytes between it and the tunnel until either
/// side closes.
///
/// Inbound `Data` payloads arrive on `inbound`; dropping its sender closes
/// the local write half. A failed dial answers with an `Error` frame and
/// affects no other stream.
pub async fn pump_stream(
    stream_id: u64,
    address: String,
    mut inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Frame>,
    dial_timeout: Duration,
    token: CancellationToken,
) {
    let socket = match tokio::time::timeout(dial_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            warn!(stream_id, %address, "Local dial failed: {}", e);
            let _ = outbound
                .send(Frame::error(stream_id, format!("dial {}: {}", address, e)))
                .await;
            return;
        }
        Err(_) => {
            warn!(stream_id, %address, "Local dial timed out");
            let _ = outbound
                .send(Frame::error(stream_id, format!("dial {}: timed out", address)))
                .await;
            return;
        }
    };
    debug!(stream_id, %address, "Local stream opened");

    let (mut reader, mut writer) = socket.into_split();

    let write_token = token.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_token.cancelled() => break,
                chunk = inbound.recv() => match chunk {
                    Some(chunk) => {
                        if writer.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let frame = Frame::data(stream_id, Bytes::copy_from_slice(&buf[..n]));
                    if outbound.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(stream_id, "Local read failed: {}", e);
                    break;
                }
            },
        }
    }

    let _ = outbound.send(Frame::close(stream_id)).await;
    let _ = writer_task.await;
    debug!(stream_id, %address, "Local stream closed");
}
