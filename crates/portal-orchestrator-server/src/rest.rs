//! HTTP REST API.
//!
//! Every handler is a thin adapter over [`Orchestrator`]: parse the
//! request, call one engine operation, serialize the result. Engine errors
//! become JSON error bodies through [`ApiError`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use portal_orchestrator::{
    BulkRequest, DiscoveryRequest, ElementFilter, ExecutionId, JobClass, Orchestrator,
    OrchestratorError, DEFAULT_ELEMENT_LIMIT,
};

use crate::error::ApiError;

/// State shared by every handler.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the axum Router with all REST endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/start", post(start_bulk))
        .route("/api/v1/mapper/start", post(start_discovery))
        .route("/api/v1/status", get(status_all))
        .route("/api/v1/status/execution/:id", get(status_one))
        .route("/api/v1/stop", post(stop))
        .route("/api/v1/report", get(report))
        .route("/api/v1/elements", get(elements))
        .route("/api/v1/events", get(events_sse))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("REST API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Unparseable ids can never name an execution, so they are unknown.
fn parse_id(raw: &str) -> ApiResult<ExecutionId> {
    raw.trim()
        .parse()
        .map_err(|_| OrchestratorError::NotFound(format!("execution {raw}")).into())
}

fn to_value<T: serde::Serialize>(value: &T) -> ApiResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| OrchestratorError::FatalExecution(format!("serializing response: {e}")).into())
}

async fn execution_status(state: &AppState, id: &ExecutionId) -> ApiResult<Value> {
    let snapshot = state.orchestrator.status(id).await?;
    let mut body = to_value(&snapshot)?;
    body["progress"] = json!(snapshot.progress_percent);
    body["summary"] = to_value(&snapshot.counts)?;
    if let Some(pool) = state.orchestrator.pool_stats(id) {
        body["pool"] = to_value(&pool)?;
    }
    Ok(body)
}

// ── Handlers ────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.orchestrator.backend_name(),
        "uptimeSeconds": state.started_at.elapsed().as_secs_f64(),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn start_bulk(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: BulkRequest = parse_body(&body)?;
    let receipt = state.orchestrator.start_bulk(request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn start_discovery(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: DiscoveryRequest = parse_body(&body)?;
    let receipt = state.orchestrator.start_discovery(request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn status_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    Ok(Json(execution_status(&state, &id).await?))
}

async fn status_all(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let executions = state.orchestrator.statuses().await;
    let running: Vec<&_> = executions
        .iter()
        .filter(|s| !s.status.is_terminal())
        .collect();
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.orchestrator.backend_name(),
        "uptimeSeconds": state.started_at.elapsed().as_secs_f64(),
        "defaults": to_value(state.orchestrator.defaults())?,
        "running": to_value(&running)?,
        "executions": to_value(&executions)?,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StopRequest {
    execution_id: Option<String>,
    job_class: Option<String>,
}

async fn stop(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<Value>> {
    let request: StopRequest = parse_body(&body)?;
    let stopped = match request.execution_id {
        Some(raw) => {
            let id = parse_id(&raw)?;
            state.orchestrator.stop(&id).await?;
            vec![id]
        }
        None => {
            let job_class = request
                .job_class
                .as_deref()
                .map(str::parse::<JobClass>)
                .transpose()?;
            state.orchestrator.stop_running(job_class).await?
        }
    };
    Ok(Json(json!({ "stopping": stopped })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportParams {
    execution_id: Option<String>,
}

async fn report(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReportParams>,
) -> ApiResult<Json<Value>> {
    let report = match params.execution_id {
        Some(raw) => state.orchestrator.report(&parse_id(&raw)?).await?,
        None => state.orchestrator.latest_report(None).await?,
    };
    Ok(Json(to_value(report.as_ref())?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElementsParams {
    execution_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    level: Option<u32>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn elements(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ElementsParams>,
) -> ApiResult<Json<Value>> {
    let id = match params.execution_id {
        Some(raw) => parse_id(&raw)?,
        None => state
            .orchestrator
            .latest(Some(JobClass::Discovery))
            .await
            .ok_or_else(|| OrchestratorError::NotFound("no discovery execution on record".into()))?,
    };
    let filter = ElementFilter {
        kind: params.kind,
        level: params.level,
    };
    let page = state
        .orchestrator
        .elements(
            &id,
            &filter,
            params.limit.unwrap_or(DEFAULT_ELEMENT_LIMIT),
            params.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(to_value(&page)?))
}

/// SSE query parameters.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsParams {
    execution_id: Option<ExecutionId>,
}

/// Server-Sent Events endpoint for real-time execution events.
///
/// Optionally filtered to one execution via `?executionId=`.
async fn events_sse(
    Query(params): Query<EventsParams>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.orchestrator.subscribe();
    let only = params.execution_id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if only.is_some_and(|id| event.execution_id() != id) {
                        continue;
                    }
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("SSE subscriber lagged, {skipped} events dropped");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
