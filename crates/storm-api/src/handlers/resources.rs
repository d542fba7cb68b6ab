use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use storm_domain::EntityKind;

use crate::error::ApiError;
use crate::handlers::common::{self, ListParams};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    common::list_collection(&state, EntityKind::Resource, &params).await
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    common::get_entity(&state, EntityKind::Resource, &id).await
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    common::create_entity(&state, EntityKind::Resource, body).await
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    common::update_entity(&state, EntityKind::Resource, &id, body, false).await
}

pub async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    common::update_entity(&state, EntityKind::Resource, &id, body, true).await
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    common::delete_entity(&state, EntityKind::Resource, &id).await
}
