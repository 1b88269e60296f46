use crate::timespec::ScheduleSyntaxError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use custodian_plugin::{FailureKind, Half, ValidationError};
use serde_json::json;

/// Why a task did not reach `done`, recorded verbatim in its log.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("schedule error: {0}")]
    ScheduleSyntax(#[from] ScheduleSyntaxError),

    #[error("{half} endpoint failed validation: {message}")]
    Validation { half: Half, message: String },

    #[error("{half} plugin does not support this operation: {message}")]
    PluginUnimplemented { half: Half, message: String },

    #[error("{message}")]
    PluginExecution { half: Option<Half>, message: String },

    #[error("agent '{agent}' unreachable after {attempts} attempt(s): {reason}")]
    AgentUnreachable { agent: String, attempts: u32, reason: String },

    #[error("task exceeded its timeout and was cancelled")]
    TimeoutExceeded,

    #[error("task was cancelled on request")]
    Cancelled,

    #[error("task was cancelled by server shutdown")]
    Shutdown,

    #[error("purge of archive {archive} failed: {message}")]
    PurgeFailed { archive: String, message: String },

    #[error("{0}")]
    Snapshot(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Maps an execution failure reported by an agent onto the taxonomy.
    pub fn from_failure(kind: FailureKind, half: Option<Half>, message: String) -> Self {
        match (kind, half) {
            (FailureKind::Validation, Some(half)) => TaskError::Validation { half, message },
            (FailureKind::Unimplemented, Some(half)) => TaskError::PluginUnimplemented { half, message },
            _ => TaskError::PluginExecution { half, message },
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// A conflicting task already holds the named resource.
    #[error("{0} already has a task in flight")]
    Busy(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Busy(_) => AppError::Conflict(e.to_string()),
            EngineError::NotFound(_) => AppError::NotFound(e.to_string()),
            EngineError::InvalidState(_) => AppError::Unprocessable(e.to_string()),
            EngineError::Database(inner) => AppError::Internal(inner),
        }
    }
}

impl From<ScheduleSyntaxError> for AppError {
    fn from(e: ScheduleSyntaxError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::Unprocessable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(anyhow::anyhow!(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mapping() {
        let e = TaskError::from_failure(FailureKind::Validation, Some(Half::Store), "bad bucket".into());
        assert!(matches!(e, TaskError::Validation { half: Half::Store, .. }));
        assert_eq!(e.to_string(), "store endpoint failed validation: bad bucket");

        let e = TaskError::from_failure(FailureKind::Execution, Some(Half::Target), "exit 2".into());
        assert!(matches!(e, TaskError::PluginExecution { .. }));
    }

    #[test]
    fn test_engine_errors_map_to_status() {
        let resp = AppError::from(EngineError::Busy("target:abc".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = AppError::from(EngineError::NotFound("task x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
