use thiserror::Error;

use crate::kernel::KernelError;
use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session busy: {session_id}")]
    SessionBusy { session_id: String },

    #[error("Failed to start kernel: {0}")]
    KernelStart(#[source] KernelError),

    #[error("Session {session_id} cannot {operation} while {state}")]
    KernelUnavailable {
        session_id: String,
        operation: &'static str,
        state: SessionState,
    },

    #[error("Invalid session state transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Execution permit belongs to session {permit_session}, not {session_id}")]
    ForeignPermit {
        session_id: String,
        permit_session: String,
    },

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("Session limit reached ({limit} live sessions)")]
    TooManySessions { limit: usize },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Stable machine-readable code used by the transports.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::SessionNotFound { .. } => "session_not_found",
            GatewayError::SessionBusy { .. } => "session_busy",
            GatewayError::KernelStart(_) => "kernel_start_error",
            GatewayError::KernelUnavailable { .. } => "kernel_unavailable",
            GatewayError::InvalidTransition { .. } => "invalid_transition",
            GatewayError::ForeignPermit { .. } => "foreign_permit",
            GatewayError::Kernel(_) => "kernel_error",
            GatewayError::TooManySessions { .. } => "too_many_sessions",
            GatewayError::Configuration(_) => "configuration_error",
            GatewayError::Io(_) => "io_error",
        }
    }

    /// True for errors caused by the request rather than by the gateway or kernel.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::SessionNotFound { .. }
                | GatewayError::SessionBusy { .. }
                | GatewayError::KernelUnavailable { .. }
        )
    }
}
