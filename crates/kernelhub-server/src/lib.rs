pub mod error;
pub mod host;
pub mod http;
pub mod stream;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use kernelhub_core::KernelGateway;

pub use error::{ApiError, Result, ServerError};
pub use host::ServiceHost;
pub use stream::{ClientFrame, ServerFrame, StreamOptions, serve_connection};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<KernelGateway>,
    pub stream_queue_timeout: Duration,
}

impl AppState {
    pub fn new(gateway: Arc<KernelGateway>) -> Self {
        Self {
            gateway,
            stream_queue_timeout: StreamOptions::default().queue_timeout,
        }
    }

    pub fn with_stream_queue_timeout(mut self, timeout: Duration) -> Self {
        self.stream_queue_timeout = timeout;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start_kernel", post(http::start_kernel))
        .route("/execute", post(http::execute))
        .route("/interrupt", post(http::interrupt))
        .route("/restart", post(http::restart))
        .route("/shutdown", post(http::shutdown))
        .route("/sessions", get(http::list_sessions))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
