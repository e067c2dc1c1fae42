//! Axum JSON API for sale triage and ingestion status.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use triage_core::{CursorPosition, StatusUpdate};
use triage_storage::{CursorStore, RunLedger, SaleOperations, StoreError};
use triage_sync::{orchestrator_from_config, IngestConfig, IngestionOrchestrator, RunOutcome};
use uuid::Uuid;

pub const CRATE_NAME: &str = "triage-web";

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub sales: Arc<dyn SaleOperations>,
    pub ledger: Arc<dyn RunLedger>,
    pub cursors: Arc<dyn CursorStore>,
    pub cursor_key: String,
    /// Enables `POST /ingestion/run` when present.
    pub orchestrator: Option<Arc<IngestionOrchestrator>>,
}

impl AppState {
    pub fn new<S>(store: Arc<S>, cursor_key: impl Into<String>) -> Self
    where
        S: SaleOperations + RunLedger + CursorStore + 'static,
    {
        Self {
            sales: store.clone(),
            ledger: store.clone(),
            cursors: store,
            cursor_key: cursor_key.into(),
            orchestrator: None,
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<IngestionOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }
}

#[derive(Debug, Deserialize)]
struct TagBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommentBody {
    author_id: Uuid,
    body: String,
}

#[derive(Debug, Deserialize)]
struct OwnerBody {
    #[serde(default)]
    user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CursorView {
    key: String,
    value: Option<String>,
    position: Option<CursorPosition>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sales/{id}", get(sale_detail_handler))
        .route("/sales/{id}/status", post(update_status_handler))
        .route("/sales/{id}/tags", post(add_tag_handler))
        .route("/sales/{id}/tags/{name}", delete(remove_tag_handler))
        .route("/sales/{id}/comments", post(add_comment_handler))
        .route("/sales/{id}/owner", post(assign_owner_handler))
        .route("/ingestion/runs", get(runs_handler))
        .route("/ingestion/cursor", get(cursor_handler))
        .route("/ingestion/run", post(trigger_run_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("TRIAGE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "triage api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let (store, orchestrator) = orchestrator_from_config(&config).await?;
    let state = AppState::new(store, config.cursor_key.clone())
        .with_orchestrator(Arc::new(orchestrator));
    serve(state, port_from_env()).await
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn sale_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.sales.sale_detail(id).await {
        Ok(detail) => Json(detail).into_response(),
        Err(err) => store_error(err),
    }
}

async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(update): Json<StatusUpdate>,
) -> Response {
    match state.sales.update_status(id, &update).await {
        Ok(sale) => Json(sale).into_response(),
        Err(err) => store_error(err),
    }
}

async fn add_tag_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<TagBody>,
) -> Response {
    match state.sales.add_tag(id, &body.name).await {
        Ok(tag) => Json(tag).into_response(),
        Err(err) => store_error(err),
    }
}

async fn remove_tag_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, name)): AxumPath<(Uuid, String)>,
) -> Response {
    match state.sales.remove_tag(id, &name).await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn add_comment_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<CommentBody>,
) -> Response {
    match state.sales.add_comment(id, body.author_id, &body.body).await {
        Ok(comment) => (StatusCode::CREATED, Json(comment)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn assign_owner_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<OwnerBody>,
) -> Response {
    match state.sales.assign_owner(id, body.user_id).await {
        Ok(sale) => Json(sale).into_response(),
        Err(err) => store_error(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, MAX_RUNS_LIMIT);
    match state.ledger.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn cursor_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cursors.get(&state.cursor_key).await {
        Ok(value) => Json(CursorView {
            key: state.cursor_key.clone(),
            position: value.as_deref().and_then(CursorPosition::decode),
            value,
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn trigger_run_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(orchestrator) = state.orchestrator.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "ingestion is not configured on this server",
        );
    };
    let outcome = orchestrator.run_once().await;
    let status = match &outcome {
        RunOutcome::Completed(_) => StatusCode::OK,
        RunOutcome::Skipped => StatusCode::CONFLICT,
        RunOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(outcome)).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    let status = match &err {
        StoreError::SaleNotFound(_) | StoreError::UserNotFound(_) | StoreError::RunNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        StoreError::StaleEdit { .. } | StoreError::RunAlreadyClosed(_) => StatusCode::CONFLICT,
        StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        StoreError::Database(_) | StoreError::Corrupt(_) => {
            error!(error = %err, "store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err.to_string())
}
