use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kernelhub_core::GatewayError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Server task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Request failure as seen by an HTTP client.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Gateway(err) => match err {
                GatewayError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
                GatewayError::SessionBusy { .. } | GatewayError::KernelUnavailable { .. } => {
                    StatusCode::CONFLICT
                }
                GatewayError::KernelStart(_) | GatewayError::TooManySessions { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                GatewayError::InvalidTransition { .. }
                | GatewayError::ForeignPermit { .. }
                | GatewayError::Kernel(_)
                | GatewayError::Configuration(_)
                | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Gateway(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Request failed");
        } else {
            warn!(code = self.code(), error = %self, "Request rejected");
        }
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelhub_core::kernel::KernelError;
    use kernelhub_core::session::SessionState;

    #[test]
    fn maps_gateway_errors_to_status_codes() {
        let cases = [
            (
                GatewayError::SessionNotFound {
                    session_id: "x".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::SessionBusy {
                    session_id: "x".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                GatewayError::KernelUnavailable {
                    session_id: "x".into(),
                    operation: "execute",
                    state: SessionState::Restarting,
                },
                StatusCode::CONFLICT,
            ),
            (
                GatewayError::KernelStart(KernelError::NotRunning),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::TooManySessions { limit: 1 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::Kernel(KernelError::NotRunning),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(
            ApiError::BadRequest("no".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
