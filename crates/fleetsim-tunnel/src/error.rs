// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Tunnel error type
#[derive(Error, Debug, Diagnostic)]
pub enum TunnelError {
    /// The controller refused the credential during the handshake
    #[error("Controller rejected credential for {cluster}/{kind} (HTTP {status})")]
    #[diagnostic(
        code(tunnel::auth_rejected),
        help("The cluster credential is stale or revoked; a fresh one must be bootstrapped before reconnecting")
    )]
    AuthRejected {
        #[allow(unused)]
        cluster: String,
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        status: u16,
    },

    /// A dial request named an address outside the session's allow-list
    #[error("Dial to {address} refused by {kind} policy")]
    #[diagnostic(
        code(tunnel::dial_refused),
        help("steve-proxy sessions may only reach the cluster's proxy port and the health endpoint")
    )]
    DialRefused {
        #[allow(unused)]
        address: String,
        #[allow(unused)]
        kind: String,
    },

    /// The websocket transport failed
    #[error("Tunnel transport error: {message}")]
    #[diagnostic(
        code(tunnel::transport),
        help("Check that the controller URL is reachable; the session reconnects automatically")
    )]
    Transport {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A malformed frame arrived on the tunnel
    #[error("Tunnel protocol error: {message}")]
    #[diagnostic(
        code(tunnel::protocol),
        help("The peer sent a frame this client does not understand")
    )]
    Protocol {
        #[allow(unused)]
        message: String,
    },

    /// An operation did not finish in time
    #[error("Timed out after {seconds}s: {operation}")]
    #[diagnostic(
        code(tunnel::timeout),
        help("Increase the corresponding timeout or check controller reachability")
    )]
    Timeout {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        seconds: u64,
    },

    /// The session was stopped before it connected
    #[error("Tunnel session {cluster}/{kind} stopped")]
    #[diagnostic(
        code(tunnel::stopped),
        help("The session was cancelled by a delete or shutdown")
    )]
    Stopped {
        #[allow(unused)]
        cluster: String,
        #[allow(unused)]
        kind: String,
    },
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Create an AuthRejected error
    pub fn auth_rejected(cluster: impl Into<String>, kind: impl Into<String>, status: u16) -> Self {
        Self::AuthRejected {
            cluster: cluster.into(),
            kind: kind.into(),
            status,
        }
    }

    /// Create a DialRefused error
    pub fn dial_refused(address: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::DialRefused {
            address: address.into(),
            kind: kind.into(),
        }
    }

    /// Create a Transport error
    pub fn transport(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source,
        }
    }

    /// Create a Protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a Stopped error
    pub fn stopped(cluster: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::Stopped {
            cluster: cluster.into(),
            kind: kind.into(),
        }
    }

    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, TunnelError::AuthRejected { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TunnelError::transport(format!("websocket: {}", err), Some(Box::new(err)))
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::transport(format!("I/O error: {}", err), Some(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TunnelError::auth_rejected("alpha", "cluster-agent", 401);
        assert!(err.is_auth_rejected());
        assert!(err.to_string().contains("alpha/cluster-agent"));

        let err = TunnelError::dial_refused("10.0.0.1:22", "steve-proxy");
        assert!(!err.is_auth_rejected());
        assert!(err.to_string().contains("10.0.0.1:22"));
    }
}
