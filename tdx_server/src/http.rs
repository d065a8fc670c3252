//! HTTP surface of the gateway.
//!
//! Handlers are thin translators between JSON and `SelectionController`.
//! Anything that may block on the network or the disk (probes, saves, loads)
//! runs on the blocking pool so async workers stay free.
//!
//! Error mapping: validation and out-of-range problems are 400, a missing
//! current server or saved snapshot is 404, everything else is 500. Error
//! bodies are `{"ok": false, "error": "..."}`, including for request bodies
//! that are not well-formed JSON of the expected shape.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tdx_common::{ProbeOutcome, ProbeResult, Result, ServerDescriptor, TdxError};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::controller::SelectionController;

type AppState = Arc<SelectionController>;

/// Error wrapper that knows its HTTP status.
#[derive(Debug)]
pub struct ApiError(TdxError);

impl From<TdxError> for ApiError {
    fn from(err: TdxError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TdxError::NotConfigured => StatusCode::NOT_FOUND,
            err if err.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "ok": false, "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// `Json` extractor whose rejection uses the service's error body.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> ApiResult<Self> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError(TdxError::Validation(rejection.body_text())))?;
        Ok(ApiJson(value))
    }
}

/// Server entry as sent by clients. The port is wide so out-of-range values
/// are reported as validation errors instead of JSON rejections.
#[derive(Debug, Deserialize)]
pub struct ServerEntry {
    pub ip: String,
    pub port: i64,
    #[serde(default)]
    pub name: Option<String>,
}

impl TryFrom<ServerEntry> for ServerDescriptor {
    type Error = TdxError;

    fn try_from(entry: ServerEntry) -> Result<Self> {
        ServerDescriptor::from_raw(&entry.ip, entry.port, entry.name.as_deref())
    }
}

#[derive(Debug, Deserialize)]
pub struct ServersPayload {
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub current_index: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SelectPayload {
    pub index: i64,
}

/// Either an explicit address or a registry index (default 0).
#[derive(Debug, Default, Deserialize)]
pub struct TestPayload {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub index: Option<i64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub server_index: Option<i64>,
}

/// Probe result as reported to clients.
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ProbeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub server: ServerDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ProbeResult> for ProbeReport {
    fn from(result: ProbeResult) -> Self {
        ProbeReport {
            ok: result.is_ok(),
            reason: result.reason(),
            latency_ms: result.latency_ms,
            server: result.target,
            error: result.error,
        }
    }
}

fn to_index(value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| TdxError::Validation(format!("index {} must not be negative", value)))
}

/// Runs `f` on the blocking pool.
async fn blocking<T, F>(controller: &AppState, f: F) -> ApiResult<T>
where
    F: FnOnce(&SelectionController) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let controller = Arc::clone(controller);
    tokio::task::spawn_blocking(move || f(&controller))
        .await
        .map_err(|e| TdxError::Task(e.to_string()))?
        .map_err(ApiError::from)
}

/// Builds the router over `controller`.
pub fn router(controller: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/servers", get(list_servers).post(save_servers))
        .route("/api/server/select", post(select_server))
        .route("/api/server/current", get(current_server))
        .route("/api/server/test", post(test_server))
        .route("/api/server/config", post(override_server))
        .route("/api/server/saved", get(saved_config))
        .route("/api/server/save", post(save_state))
        .route("/api/server/failover", post(failover))
        .route("/api/connect", post(connect))
        .route("/api/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(controller)
}

/// Binds `addr` and serves until Ctrl+C.
pub async fn serve(controller: AppState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received. Shutting down...");
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "TDX quote server gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_servers(State(controller): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(controller.get_servers()?))
}

async fn save_servers(
    State(controller): State<AppState>,
    ApiJson(payload): ApiJson<ServersPayload>,
) -> ApiResult<Json<Value>> {
    let servers = payload
        .servers
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            ServerDescriptor::try_from(entry).map_err(|e| e.in_context(format!("server #{}", i)))
        })
        .collect::<Result<Vec<_>>>()?;
    let current_index = payload.current_index.map(to_index).transpose()?;

    controller.set_servers(servers, current_index)?;
    Ok(Json(json!({ "ok": true })))
}

async fn select_server(
    State(controller): State<AppState>,
    ApiJson(payload): ApiJson<SelectPayload>,
) -> ApiResult<Json<Value>> {
    let server = controller.select_server(to_index(payload.index)?)?;
    Ok(Json(json!({ "ok": true, "server": server })))
}

async fn current_server(State(controller): State<AppState>) -> ApiResult<Json<ServerDescriptor>> {
    Ok(Json(controller.get_current_server()?))
}

async fn test_server(
    State(controller): State<AppState>,
    ApiJson(payload): ApiJson<TestPayload>,
) -> ApiResult<Json<ProbeReport>> {
    let timeout = payload.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis);

    let result = match (payload.ip, payload.port) {
        (Some(ip), Some(port)) => {
            let target = ServerDescriptor::from_raw(&ip, port, None)?;
            blocking(&controller, move |c| Ok(c.test_server(&target, timeout))).await?
        }
        (None, None) => {
            let index = to_index(payload.index.unwrap_or(0))?;
            blocking(&controller, move |c| c.test_registered(index, timeout)).await?
        }
        _ => {
            return Err(TdxError::Validation("ip and port must be given together".into()).into());
        }
    };
    Ok(Json(result.into()))
}

async fn override_server(
    State(controller): State<AppState>,
    ApiJson(entry): ApiJson<ServerEntry>,
) -> ApiResult<Json<Value>> {
    let descriptor = ServerDescriptor::try_from(entry)?;
    let snapshot = blocking(&controller, move |c| c.override_with_single_server(descriptor)).await?;
    Ok(Json(json!({
        "ok": true,
        "server": snapshot.servers.first(),
        "saved_at": snapshot.saved_at,
    })))
}

async fn saved_config(State(controller): State<AppState>) -> ApiResult<Response> {
    let saved = blocking(&controller, |c| Ok(c.get_saved_config())).await?;
    Ok(match saved {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": "no saved server configuration" })),
        )
            .into_response(),
    })
}

async fn save_state(State(controller): State<AppState>) -> ApiResult<Json<Value>> {
    let snapshot = blocking(&controller, |c| c.save_current_state()).await?;
    Ok(Json(json!({ "ok": true, "saved_at": snapshot.saved_at })))
}

async fn failover(State(controller): State<AppState>) -> ApiResult<Json<Value>> {
    let report = blocking(&controller, |c| c.failover()).await?;
    let attempts: Vec<ProbeReport> = report.attempts.into_iter().map(ProbeReport::from).collect();
    Ok(Json(json!({
        "ok": report.selected_index.is_some(),
        "selected_index": report.selected_index,
        "server": report.server,
        "attempts": attempts,
    })))
}

async fn connect(
    State(controller): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> ApiResult<Json<Value>> {
    let index = to_index(query.server_index.unwrap_or(0))?;
    let report = blocking(&controller, move |c| c.connect_server(index)).await?;
    Ok(Json(json!({
        "success": report.success,
        "server": report.success.then_some(report.server),
        "probe": ProbeReport::from(report.probe),
    })))
}

async fn status(State(controller): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(controller.status()?))
}
