// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// State store error type
#[derive(Error, Debug, Diagnostic)]
pub enum StateError {
    /// Neither the state file nor its backup could be parsed
    #[error("State file {path} and its backup are both unreadable")]
    #[diagnostic(
        code(state::corrupt),
        help("Refusing to start with an empty fleet while simulated clusters may still exist. Inspect or restore {path} (primary error: {primary}; backup error: {backup}), or remove it to start from scratch")
    )]
    Corrupt {
        path: String,
        primary: String,
        backup: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(state::serialization_error),
        help("Ensure the snapshot contains only serializable values")
    )]
    SerializationError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O error
    #[error("I/O error: {message}")]
    #[diagnostic(
        code(state::io_error),
        help("Check filesystem permissions and available disk space for the state directory")
    )]
    IoError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Create a Corrupt error
    pub fn corrupt(
        path: impl Into<String>,
        primary: impl Into<String>,
        backup: impl Into<String>,
    ) -> Self {
        Self::Corrupt {
            path: path.into(),
            primary: primary.into(),
            backup: backup.into(),
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

    /// Create an IoError
    pub fn io_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::IoError {
            message: message.into(),
            source,
        }
    }

    /// Whether startup must stop for operator intervention
    pub fn is_fatal(&self) -> bool {
        matches!(self, StateError::Corrupt { .. })
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::serialization_error(format!("JSON error: {}", err), Some(Box::new(err)))
    }
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::io_error(format!("I/O error: {}", err), Some(Box::new(err)))
    }
}

impl From<tempfile::PersistError> for StateError {
    fn from(err: tempfile::PersistError) -> Self {
        StateError::io_error(
            format!("Failed to replace state file: {}", err.error),
            Some(Box::new(err.error)),
        )
    }
}
