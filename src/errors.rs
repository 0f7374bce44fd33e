use crate::models::MachineId;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("required binary '{0}' not found in PATH")]
    MissingBinary(String),
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("interface name '{0}' exceeds the kernel limit")]
    InterfaceNameTooLong(String),
    #[error("failed to {step}: {source}")]
    Provisioning {
        step: String,
        #[source]
        source: Box<SessionError>,
    },
    #[error("failed to start machine {machine}: {message}")]
    MachineStart { machine: MachineId, message: String },
    #[error("machine {0} console closed")]
    ConsoleClosed(MachineId),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn provisioning(step: impl Into<String>, source: SessionError) -> Self {
        SessionError::Provisioning {
            step: step.into(),
            source: Box::new(source),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match self {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SessionError::MissingBinary(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::CommandFailed { .. }
            | SessionError::InterfaceNameTooLong(_)
            | SessionError::Provisioning { .. }
            | SessionError::MachineStart { .. }
            | SessionError::ConsoleClosed(_)
            | SessionError::Internal(_)
            | SessionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let code = match status.as_u16() {
            400 => "bad_request",
            404 => "not_found",
            500 => "internal_error",
            503 => "unavailable",
            _ => "error",
        }
        .to_string();

        let body = ErrorBody {
            code,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
