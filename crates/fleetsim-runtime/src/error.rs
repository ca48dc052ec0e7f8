use miette::Diagnostic;
use thiserror::Error;

/// Runtime error type for cluster lifecycle operations
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// Cluster already tracked
    #[error("Cluster already exists: {name}")]
    #[diagnostic(
        code(fleetsim::runtime::already_exists),
        help("Delete the existing cluster first, or use a different name")
    )]
    AlreadyExists {
        #[allow(unused)]
        name: String,
    },

    /// Cluster not tracked
    #[error("Cluster not found: {name}")]
    #[diagnostic(
        code(fleetsim::runtime::not_found),
        help("Use `GET /clusters` to see tracked clusters")
    )]
    NotFound {
        #[allow(unused)]
        name: String,
    },

    /// A pipeline for the cluster is already running
    #[error("A pipeline is already running for cluster '{name}'")]
    #[diagnostic(
        code(fleetsim::runtime::pipeline_busy),
        help("Wait for the running pipeline to finish; concurrent pipelines for one cluster are coalesced")
    )]
    PipelineBusy {
        #[allow(unused)]
        name: String,
    },

    /// Command execution failed
    #[error("Command '{command}' failed with exit code {exit_code}")]
    #[diagnostic(code(fleetsim::runtime::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        exit_code: i32,
        #[allow(unused)]
        stderr: String,
    },

    /// Shared control plane unusable
    #[error("Control plane error: {message}")]
    #[diagnostic(
        code(fleetsim::runtime::control_plane),
        help("Check `kwokctl get clusters` and the control plane logs under the kwok cluster directory")
    )]
    ControlPlane {
        #[allow(unused)]
        message: String,
    },

    /// Controller API call failed
    #[error("Controller request failed: {message}")]
    #[diagnostic(
        code(fleetsim::runtime::controller),
        help("Verify the controller URL and bearer token; use --insecure for controllers with self-signed certificates")
    )]
    Controller {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        status: Option<u16>,
    },

    /// Credential secret never appeared
    #[error("Credential secret did not appear in namespace {namespace} after {attempts} polls")]
    #[diagnostic(
        code(fleetsim::runtime::credential_timeout),
        help("The registration manifest was applied but produced no credential secret. Resources are left in place for inspection")
    )]
    CredentialTimeout {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        attempts: u32,
    },

    /// Controller kept rejecting re-bootstrapped credentials
    #[error("Controller rejected the credential for '{cluster}' after {attempts} re-bootstrap attempts")]
    #[diagnostic(
        code(fleetsim::runtime::credential_rejected),
        help("Check that the cluster still exists on the controller and that its registration tokens are valid")
    )]
    CredentialRejected {
        #[allow(unused)]
        cluster: String,
        #[allow(unused)]
        attempts: u32,
    },

    /// No bindable port left
    #[error("No free proxy port in {base}..={max}")]
    #[diagnostic(
        code(fleetsim::runtime::port_exhausted),
        help("Delete unused clusters or raise the proxy port range")
    )]
    PortExhausted {
        #[allow(unused)]
        base: u16,
        #[allow(unused)]
        max: u16,
    },

    /// Proxy listener could not bind
    #[error("Failed to bind proxy port {port}: {message}")]
    #[diagnostic(
        code(fleetsim::runtime::proxy_bind),
        help("Another process may hold the port. Check with `ss -ltnp`")
    )]
    ProxyBind {
        #[allow(unused)]
        port: u16,
        #[allow(unused)]
        message: String,
    },

    /// Registration manifest could not be rewritten
    #[error("Invalid registration manifest: {message}")]
    #[diagnostic(
        code(fleetsim::runtime::manifest),
        help("The controller returned YAML this agent cannot scope to a tenant namespace")
    )]
    Manifest {
        #[allow(unused)]
        message: String,
    },

    /// External call exceeded its bound
    #[error("Timed out after {seconds}s: {operation}")]
    #[diagnostic(
        code(fleetsim::runtime::timeout),
        help("Raise the corresponding timeout or check that the external service is responsive")
    )]
    Timeout {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        seconds: u64,
    },

    /// Pipeline cancelled by delete or shutdown
    #[error("Cluster '{name}' was cancelled")]
    #[diagnostic(
        code(fleetsim::runtime::cancelled),
        help("The cluster is being deleted or the process is shutting down")
    )]
    Cancelled {
        #[allow(unused)]
        name: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] fleetsim_core::FleetError),

    /// State store error
    #[error(transparent)]
    #[diagnostic(transparent)]
    StateError(#[from] fleetsim_state::StateError),

    /// Tunnel error
    #[error(transparent)]
    #[diagnostic(transparent)]
    TunnelError(#[from] fleetsim_tunnel::TunnelError),

    /// Internal error
    #[error("Internal runtime error: {message}")]
    #[diagnostic(
        code(fleetsim::runtime::internal_error),
        help("This is likely a bug in fleetsim-runtime. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn pipeline_busy(name: impl Into<String>) -> Self {
        Self::PipelineBusy { name: name.into() }
    }

    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn control_plane(message: impl Into<String>) -> Self {
        Self::ControlPlane {
            message: message.into(),
        }
    }

    pub fn controller(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Controller {
            message: message.into(),
            status,
        }
    }

    pub fn credential_timeout(namespace: impl Into<String>, attempts: u32) -> Self {
        Self::CredentialTimeout {
            namespace: namespace.into(),
            attempts,
        }
    }

    pub fn credential_rejected(cluster: impl Into<String>, attempts: u32) -> Self {
        Self::CredentialRejected {
            cluster: cluster.into(),
            attempts,
        }
    }

    pub fn proxy_bind(port: u16, message: impl Into<String>) -> Self {
        Self::ProxyBind {
            port,
            message: message.into(),
        }
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn cancelled(name: impl Into<String>) -> Self {
        Self::Cancelled { name: name.into() }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether a stage may retry after this error.
    ///
    /// Exhausted budgets and rejected credentials are final for the stage.
    pub fn is_transient(&self) -> bool {
        match self {
            RuntimeError::CommandFailed { .. }
            | RuntimeError::ControlPlane { .. }
            | RuntimeError::Timeout { .. }
            | RuntimeError::ProxyBind { .. } => true,
            RuntimeError::Controller { status, .. } => {
                !matches!(status, Some(400) | Some(401) | Some(403) | Some(404))
            }
            RuntimeError::TunnelError(e) => !e.is_auth_rejected(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RuntimeError::timeout("kubectl apply", 30).is_transient());
        assert!(RuntimeError::controller("connection reset", None).is_transient());
        assert!(RuntimeError::controller("bad gateway", Some(502)).is_transient());

        assert!(!RuntimeError::controller("unauthorized", Some(401)).is_transient());
        assert!(!RuntimeError::credential_timeout("fleet-alpha", 30).is_transient());
        assert!(!RuntimeError::already_exists("alpha").is_transient());
        assert!(!RuntimeError::TunnelError(fleetsim_tunnel::TunnelError::auth_rejected(
            "alpha",
            "cluster-agent",
            401
        ))
        .is_transient());
    }

    #[test]
    fn test_error_messages_name_the_cluster() {
        assert_eq!(
            RuntimeError::already_exists("test-cluster-012").to_string(),
            "Cluster already exists: test-cluster-012"
        );
        assert!(RuntimeError::credential_rejected("alpha", 3)
            .to_string()
            .contains("alpha"));
    }
}
