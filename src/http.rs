use crate::store::{MetricsStore, StoreError};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::error;

const DEFAULT_WINDOW: u32 = 100;
const MAX_WINDOW: u32 = 10_000;

/// Everything a query handler needs: the store location, nothing shared
/// in memory with the sampling loop. Each request opens its own read-only
/// handle, so a slow reader can never block a write tick.
#[derive(Clone)]
pub struct QueryState {
    pub db_path: PathBuf,
    pub interval_secs: u64,
}

pub fn build_router(state: QueryState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/latest", get(latest_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/db-size", get(db_size_handler))
        .route("/api/temperatures", get(temperatures_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    limit: Option<u32>,
}

async fn latest_handler(
    State(state): State<QueryState>,
    Query(params): Query<LatestParams>,
) -> Response {
    let n = params
        .limit
        .unwrap_or(DEFAULT_WINDOW)
        .clamp(1, MAX_WINDOW);
    match with_store(state, move |store| store.recent(n)).await {
        Ok(window) => Json(window).into_response(),
        Err(err) => storage_fault("recent window query failed", err),
    }
}

async fn stats_handler(State(state): State<QueryState>) -> Response {
    match with_store(state, |store| store.aggregate()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => storage_fault("aggregate query failed", err),
    }
}

async fn db_size_handler(State(state): State<QueryState>) -> Response {
    match with_store(state, |store| store.size_stats()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => storage_fault("size stats query failed", err),
    }
}

async fn temperatures_handler(State(state): State<QueryState>) -> Response {
    match with_store(state, |store| store.latest_temperatures()).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no records" })),
        )
            .into_response(),
        Err(err) => storage_fault("temperature query failed", err),
    }
}

/// Run a read against a fresh read-only store handle off the async runtime.
async fn with_store<T, F>(state: QueryState, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&MetricsStore) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let store = MetricsStore::open_read_only(&state.db_path, state.interval_secs)?;
        op(&store)
    })
    .await
    .map_err(|join_err| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            join_err.to_string(),
        ))
    })?
}

fn storage_fault(context: &str, err: StoreError) -> Response {
    error!(error = %err, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
