use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::executions::{AbortOutcome, ExecutionRecord, ExecutionRegistry};
use crate::middleware::request_logging;
use crate::models::{FailedWindow, FinalResult, ResultSummary, SymbolFrequency};
use crate::pipeline::{new_run_id, OrderAnalytics, PipelineCoordinator, PipelineError, PipelineRun, RunRequest};
use crate::storage::{final_result_key, BlobStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<PipelineCoordinator>,
    pub executions: Arc<ExecutionRegistry>,
}

impl AppState {
    pub fn new(coordinator: Arc<PipelineCoordinator>) -> Self {
        Self {
            coordinator,
            executions: Arc::new(ExecutionRegistry::new()),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api_index))
        .route("/health", get(health_check))
        .route("/api/symbols", get(get_symbols))
        .route("/api/extract-orders", post(extract_orders))
        .route("/api/extract-single-symbol", post(extract_single_symbol))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/:id", get(get_execution))
        .route("/api/executions/:id/abort", post(abort_execution))
        .route("/api/results/:id", get(get_result))
        .route("/api/results/:id/analytics", get(get_result_analytics))
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

// ===== Route Handlers =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Service description and route listing
async fn api_index() -> Json<serde_json::Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /health",
            "GET /api/symbols",
            "POST /api/extract-orders",
            "POST /api/extract-single-symbol",
            "GET /api/executions",
            "GET /api/executions/:id",
            "POST /api/executions/:id/abort",
            "GET /api/results/:id",
            "GET /api/results/:id/analytics",
        ],
    }))
}

#[derive(Serialize)]
struct SymbolsResponse {
    count: usize,
    symbols: Vec<String>,
    frequencies: Vec<SymbolFrequency>,
    windows_failed: Vec<FailedWindow>,
    windows_capped: Vec<u32>,
    windows_page_limited: Vec<u32>,
}

/// Run discovery over the configured horizon
async fn get_symbols(State(state): State<AppState>) -> Result<Json<SymbolsResponse>, ApiError> {
    let horizon = state.coordinator.current_horizon()?;
    let report = state.coordinator.discover_symbols(&horizon).await?;

    Ok(Json(SymbolsResponse {
        count: report.unified.len(),
        symbols: report.unified.symbols,
        frequencies: report.unified.frequencies,
        windows_failed: report.failed,
        windows_capped: report.capped,
        windows_page_limited: report.page_limited,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExtractOrdersRequest {
    /// Skip discovery and extract exactly these symbols.
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
}

/// Start a pipeline run in the background
async fn extract_orders(
    State(state): State<AppState>,
    Json(req): Json<ExtractOrdersRequest>,
) -> Result<Response, ApiError> {
    if matches!(&req.symbols, Some(s) if s.iter().all(|x| x.trim().is_empty())) {
        return Err(ApiError::BadRequest("symbols must not be empty".to_string()));
    }

    let execution_id = new_run_id();
    spawn_run(&state, &execution_id, req.symbols);

    info!(execution_id = %execution_id, "Pipeline run started");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "started",
            "execution_id": execution_id,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ExtractSingleSymbolRequest {
    pub symbol: String,
}

#[derive(Serialize)]
struct SingleSymbolResponse {
    symbol: String,
    execution_id: String,
    result_key: String,
    summary: ResultSummary,
}

/// Extract and collect one symbol, answering once the run finishes
async fn extract_single_symbol(
    State(state): State<AppState>,
    Json(req): Json<ExtractSingleSymbolRequest>,
) -> Result<Json<SingleSymbolResponse>, ApiError> {
    let symbol = req.symbol.trim().to_string();
    if symbol.is_empty() {
        return Err(ApiError::BadRequest("symbol is required".to_string()));
    }

    // The run owns its task, so a dropped connection still records an outcome.
    let execution_id = new_run_id();
    let run = spawn_run(&state, &execution_id, Some(vec![symbol.clone()]))
        .await
        .map_err(|e| ApiError::Internal(format!("run task failed: {}", e)))??;

    Ok(Json(SingleSymbolResponse {
        symbol,
        execution_id,
        result_key: run.result_key,
        summary: run.result.summary(),
    }))
}

/// Register a run and drive it on its own task; the registry records the outcome.
fn spawn_run(
    state: &AppState,
    execution_id: &str,
    symbols: Option<Vec<String>>,
) -> JoinHandle<Result<PipelineRun, PipelineError>> {
    let control = state.executions.register(execution_id, symbols.clone());
    let coordinator = Arc::clone(&state.coordinator);
    let executions = Arc::clone(&state.executions);
    let request = RunRequest {
        run_id: execution_id.to_string(),
        horizon: None,
        symbols,
    };
    let id = execution_id.to_string();
    tokio::spawn(async move {
        let outcome = coordinator.run(request, &control).await;
        if let Err(e) = &outcome {
            warn!(execution_id = %id, "Pipeline run did not complete: {}", e);
        }
        executions.finish(&id, &outcome);
        outcome
    })
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    10
}

const MAX_LIST_LIMIT: usize = 100;

/// Recent executions, newest first
async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Json<serde_json::Value> {
    let executions = state.executions.list(query.limit.min(MAX_LIST_LIMIT));
    Json(json!({
        "count": executions.len(),
        "executions": executions,
    }))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    state
        .executions
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Execution {} not found", id)))
}

async fn abort_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.executions.abort(&id) {
        AbortOutcome::Requested => Ok(Json(json!({ "execution_id": id, "abort_requested": true }))),
        AbortOutcome::AlreadyFinished => Err(ApiError::Conflict(format!("Execution {} already finished", id))),
        AbortOutcome::NotFound => Err(ApiError::NotFound(format!("Execution {} not found", id))),
    }
}

/// Stream the persisted final result
async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let key = final_result_key(&id);
    let bytes = state
        .coordinator
        .store()
        .get(&key)
        .await
        .map_err(PipelineError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("Result {} not found", id)))?;

    Ok(([(header::CONTENT_TYPE, "application/json")], Body::from(bytes)).into_response())
}

/// Order statistics of a persisted result, without the order payload
async fn get_result_analytics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrderAnalytics>, ApiError> {
    let bytes = state
        .coordinator
        .store()
        .get(&final_result_key(&id))
        .await
        .map_err(PipelineError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("Result {} not found", id)))?;
    let result: FinalResult = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::Internal(format!("Result {} is unreadable: {}", id, e)))?;

    Ok(Json(result.analytics))
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Pipeline(PipelineError::Configuration(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Pipeline(err @ PipelineError::Aborted { .. }) => (StatusCode::CONFLICT, err.to_string()),
            ApiError::Pipeline(err) => {
                tracing::error!("Pipeline error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
