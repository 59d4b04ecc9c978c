//! Management HTTP surface: register/deregister/list/get predicates, plus
//! `/metrics` and the status websocket routes. Bound to
//! `management.bind_address`, separate from the Stacks event-observer's
//! own ingest server.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use crate::error::EngineError;
use crate::lifecycle::LifecycleController;
use crate::predicates::types::{Predicate, PredicateStatus};

#[derive(Clone)]
pub struct ApiState {
    pub lifecycle: Arc<LifecycleController>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/v1/predicates", get(list_predicates).post(register_predicate))
        .route("/api/v1/predicates/{uuid}", get(get_predicate).delete(deregister_predicate))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn root_handler() -> &'static str {
    "chainhook-engine"
}

async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

#[derive(Serialize)]
struct PredicateView {
    predicate: Predicate,
    status: PredicateStatus,
}

async fn list_predicates(State(state): State<ApiState>) -> Result<Json<Vec<PredicateView>>, ApiError> {
    let predicates = state.lifecycle.store().list().await?;
    Ok(Json(
        predicates
            .into_iter()
            .map(|(predicate, status)| PredicateView { predicate, status })
            .collect(),
    ))
}

async fn get_predicate(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
) -> Result<Json<PredicateView>, ApiError> {
    let predicate = state
        .lifecycle
        .store()
        .get(&uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound(uuid.clone()))?;
    let status = state.lifecycle.store().get_status(&uuid).await?.unwrap_or(PredicateStatus::New);
    Ok(Json(PredicateView { predicate, status }))
}

async fn register_predicate(
    State(state): State<ApiState>,
    Json(predicate): Json<Predicate>,
) -> Result<Json<PredicateView>, ApiError> {
    let uuid = predicate.uuid.clone();
    state.lifecycle.register(predicate).await?;
    let predicate = state.lifecycle.store().get(&uuid).await?.ok_or_else(|| ApiError::NotFound(uuid.clone()))?;
    let status = state.lifecycle.store().get_status(&uuid).await?.unwrap_or(PredicateStatus::New);
    Ok(Json(PredicateView { predicate, status }))
}

async fn deregister_predicate(State(state): State<ApiState>, Path(uuid): Path<String>) -> Result<StatusCode, ApiError> {
    state.lifecycle.deregister(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

enum ApiError {
    NotFound(String),
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(uuid) => (StatusCode::NOT_FOUND, format!("predicate {} not found", uuid)),
            ApiError::Engine(EngineError::PredicateAuthoring { detail }) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Engine(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
