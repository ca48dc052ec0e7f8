// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for fleet bookkeeping
#[derive(Error, Debug, Diagnostic)]
pub enum FleetError {
    /// Cluster name rejected
    #[error("Invalid cluster name '{name}': {reason}")]
    #[diagnostic(
        code(fleetsim::invalid_name),
        help("Cluster names must be lowercase alphanumeric or '-', start and end with an alphanumeric character, and be at most {max_len} characters")
    )]
    InvalidName {
        #[allow(unused)]
        name: String,
        #[allow(unused)]
        reason: String,
        #[allow(unused)]
        max_len: usize,
    },

    /// Status transition not allowed by the lifecycle
    #[error("Invalid status transition for cluster '{cluster}': {from} -> {to}")]
    #[diagnostic(
        code(fleetsim::invalid_transition),
        help("Happy-path statuses only move forward; only a delete may enter Deleting, and terminal statuses never change")
    )]
    InvalidTransition {
        #[allow(unused)]
        cluster: String,
        #[allow(unused)]
        from: String,
        #[allow(unused)]
        to: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(fleetsim::serialization_error),
        help("Ensure the document is valid JSON in the fleet snapshot format")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// Create an InvalidName error
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>, max_len: usize) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
            max_len,
        }
    }

    /// Create an InvalidTransition error
    pub fn invalid_transition(
        cluster: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            cluster: cluster.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = FleetError::invalid_name("Bad", "uppercase", 50);
        assert!(matches!(err, FleetError::InvalidName { .. }));
        assert!(err.to_string().contains("Bad"));

        let err = FleetError::invalid_transition("alpha", "Ready", "Creating");
        assert_eq!(
            err.to_string(),
            "Invalid status transition for cluster 'alpha': Ready -> Creating"
        );
    }
}
