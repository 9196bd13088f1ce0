//! Request/response endpoints. Each execute call runs to completion and
//! returns every event at once.

use axum::Json;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use kernelhub_core::{
    Completion, ExecutionReport, GatewayError, OutputEvent, SessionId, SessionInfo,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AppState;
use crate::error::ApiError;

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct SessionForm {
    #[serde(alias = "kernel_id")]
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteForm {
    #[serde(alias = "kernel_id")]
    pub session_id: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: SessionId,
    /// Same value as `session_id`, for clients of the older API.
    pub kernel_id: SessionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub session_id: SessionId,
    pub events: Vec<OutputEvent>,
    #[serde(flatten)]
    pub completion: Completion,
    /// Plain text of every output event, in order.
    pub outputs: Vec<String>,
}

impl ExecuteResponse {
    fn new(session_id: SessionId, report: ExecutionReport) -> Self {
        let outputs = report
            .events
            .iter()
            .filter_map(|event| match event {
                OutputEvent::Stream { text, .. } | OutputEvent::Result { text } => {
                    Some(text.clone())
                }
                OutputEvent::Error { trace, .. } => Some(trace.join("\n")),
                OutputEvent::StatusIdle | OutputEvent::StatusBusy => None,
            })
            .collect();
        Self {
            session_id,
            events: report.events,
            completion: report.completion,
            outputs,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }
}

/// Ids that do not parse cannot name a live session.
fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::Gateway(GatewayError::SessionNotFound {
            session_id: raw.to_string(),
        })
    })
}

fn form<T>(form: Result<Form<T>, FormRejection>) -> Result<T, ApiError> {
    form.map(|Form(inner)| inner)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

pub async fn start_kernel(State(state): State<AppState>) -> ApiResult<StartResponse> {
    let session_id = state.gateway.start_session().await?;
    Ok(Json(StartResponse {
        session_id,
        kernel_id: session_id,
    }))
}

pub async fn execute(
    State(state): State<AppState>,
    body: Result<Form<ExecuteForm>, FormRejection>,
) -> ApiResult<ExecuteResponse> {
    let body = form(body)?;
    let session_id = parse_session_id(&body.session_id)?;
    debug!(session_id = %session_id, code_len = body.code.len(), "Execute request");

    let report = state.gateway.execute_collect(&session_id, &body.code).await?;
    Ok(Json(ExecuteResponse::new(session_id, report)))
}

pub async fn interrupt(
    State(state): State<AppState>,
    body: Result<Form<SessionForm>, FormRejection>,
) -> ApiResult<StatusResponse> {
    let session_id = parse_session_id(&form(body)?.session_id)?;
    state.gateway.interrupt(&session_id).await?;
    Ok(Json(StatusResponse::new("interrupted")))
}

pub async fn restart(
    State(state): State<AppState>,
    body: Result<Form<SessionForm>, FormRejection>,
) -> ApiResult<StatusResponse> {
    let session_id = parse_session_id(&form(body)?.session_id)?;
    state.gateway.restart(&session_id).await?;
    Ok(Json(StatusResponse::new("restarted")))
}

pub async fn shutdown(
    State(state): State<AppState>,
    body: Result<Form<SessionForm>, FormRejection>,
) -> ApiResult<StatusResponse> {
    let raw = form(body)?.session_id;
    // Unknown or malformed ids are already shut down.
    if let Ok(session_id) = raw.parse::<SessionId>() {
        state.gateway.shutdown_session(&session_id).await;
    }
    Ok(Json(StatusResponse::new("shutdown")))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.gateway.sessions().await)
}
