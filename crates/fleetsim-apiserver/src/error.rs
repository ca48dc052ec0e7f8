use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetsim_runtime::RuntimeError;
use serde_json::json;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    /// Cluster not tracked (404)
    NotFound(String),

    /// Cluster name already tracked (409)
    AlreadyExists(String),

    /// A pipeline for the cluster is running (409)
    Conflict(String),

    /// Invalid input (400)
    BadRequest(String),

    /// Internal server error (500)
    Internal(String),
}

/// Result type for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::AlreadyExists(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "success": false,
            "message": message,
        }));

        (status, body).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            RuntimeError::AlreadyExists { .. } => ApiError::AlreadyExists(err.to_string()),
            RuntimeError::PipelineBusy { .. } => ApiError::Conflict(err.to_string()),
            RuntimeError::CoreError(fleetsim_core::FleetError::InvalidName { .. }) => {
                ApiError::BadRequest(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_map_to_status_codes() {
        let status = |err: RuntimeError| ApiError::from(err).into_response().status();

        assert_eq!(status(RuntimeError::not_found("a")), StatusCode::NOT_FOUND);
        assert_eq!(status(RuntimeError::already_exists("a")), StatusCode::CONFLICT);
        assert_eq!(status(RuntimeError::pipeline_busy("a")), StatusCode::CONFLICT);
        assert_eq!(
            status(fleetsim_core::validate_cluster_name("A").unwrap_err().into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(RuntimeError::internal_error("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
