use crate::bridge::run_bridge;
use crate::errors::{ErrorBody, SessionError, SessionResult};
use crate::models::{
    CreateSessionResponse, HealthResponse, MachineId, MachineStatus, MachineSummary,
    SessionSummary,
};
use crate::service::{AppState, SessionService};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::OpenApi as UtoipaOpenApi;

#[derive(Debug, Default, Deserialize)]
struct SessionParams {
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AttachParams {
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
    machine: Option<String>,
}

fn required(value: Option<String>, name: &str) -> SessionResult<String> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SessionError::InvalidRequest(format!("missing {name}")))
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(health, create_session, close_session, list_sessions, attach_console),
    components(schemas(
        CreateSessionResponse,
        SessionSummary,
        MachineSummary,
        MachineStatus,
        MachineId,
        HealthResponse,
        ErrorBody
    )),
    tags((name = "sessions", description = "Ephemeral two-machine terminal sessions"))
)]
pub struct ApiDoc;

pub fn build_router(service: Arc<dyn SessionService>) -> Router {
    let state = AppState::new(service);

    Router::new()
        .route("/healthz", get(health))
        .route("/create_session", get(create_session).post(create_session))
        .route(
            "/close_session",
            get(close_session).post(close_session).delete(close_session),
        )
        .route("/sessions", get(list_sessions))
        .route("/ws", any(attach_console))
        .route("/openapi.json", get(openapi))
        .with_state(state)
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    method(get, post),
    path = "/create_session",
    tag = "sessions",
    responses(
        (status = 200, description = "Session created", body = CreateSessionResponse),
        (status = 500, description = "Provisioning failed", body = ErrorBody),
        (status = 503, description = "Host cannot run sessions", body = ErrorBody)
    )
)]
async fn create_session(
    state: State<AppState>,
) -> SessionResult<Json<CreateSessionResponse>> {
    match state.service.create().await {
        Ok(created) => Ok(Json(created)),
        Err(error) => {
            tracing::error!("failed to create session: {error}");
            Err(error)
        }
    }
}

#[utoipa::path(
    method(get, post, delete),
    path = "/close_session",
    tag = "sessions",
    params(("sessionID" = String, Query, description = "Session identifier")),
    responses(
        (status = 200, description = "Session torn down"),
        (status = 400, description = "Missing session id", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    )
)]
async fn close_session(
    state: State<AppState>,
    Query(params): Query<SessionParams>,
) -> SessionResult<StatusCode> {
    let id = required(params.session_id, "sessionID")?;
    state.service.close(id).await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/sessions",
    tag = "sessions",
    responses((status = 200, description = "Registered sessions", body = [SessionSummary]))
)]
async fn list_sessions(state: State<AppState>) -> SessionResult<Json<Vec<SessionSummary>>> {
    let sessions = state.service.list().await?;
    Ok(Json(sessions))
}

/// Attaches a WebSocket to one machine's console.
///
/// Parameters and the session are resolved before the upgrade, so a bad
/// request never reaches the WebSocket handshake.
#[utoipa::path(
    get,
    path = "/ws",
    tag = "sessions",
    params(
        ("sessionID" = String, Query, description = "Session identifier"),
        ("machine" = String, Query, description = "Machine id, \"1\" or \"2\"")
    ),
    responses(
        (status = 101, description = "Switching to the console stream"),
        (status = 400, description = "Missing or invalid parameter", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    )
)]
async fn attach_console(
    state: State<AppState>,
    Query(params): Query<AttachParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let resolved = async {
        let id = required(params.session_id, "sessionID")?;
        let machine: MachineId = required(params.machine, "machine")?.parse()?;
        let attachment = state.service.open_console(id.clone(), machine).await?;
        Ok::<_, SessionError>((id, machine, attachment))
    };
    let (id, machine, attachment) = match resolved.await {
        Ok(resolved) => resolved,
        Err(error) => return error.into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let on_activity = attachment.on_activity;
        run_bridge(&id, machine, attachment.console, sink, stream, move || {
            on_activity()
        })
        .await;
    })
}
