// src/api.rs
//! Read-only status endpoints for operators.

use std::sync::Arc;

use shuttle_axum::axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::backend::{BackendStatus, Health};
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/backends", get(list_backends))
        .route("/backends/{id}", get(get_backend))
        .with_state(state)
}

#[derive(serde::Serialize)]
struct HealthResp {
    status: &'static str,
    backends: usize,
    degraded: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    let statuses = state.registry.statuses().await;
    let degraded = statuses
        .iter()
        .filter(|s| s.health != Health::Healthy)
        .count();
    Json(HealthResp {
        status: "ok",
        backends: statuses.len(),
        degraded,
    })
}

async fn list_backends(State(state): State<AppState>) -> Json<Vec<BackendStatus>> {
    Json(state.registry.statuses().await)
}

async fn get_backend(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, "invalid backend id").into_response();
    };
    match state.registry.get(id).await {
        Some(backend) => Json(backend.status().await).into_response(),
        None => (StatusCode::NOT_FOUND, "backend not found").into_response(),
    }
}
