use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use storm_domain::{EntityKind, ValidationErrors};
use storm_engine::{finish_job, handle_job, JobOutcome};

use crate::error::ApiError;
use crate::handlers::common::{self, ListParams};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    common::list_collection(&state, EntityKind::Job, &params).await
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    common::get_entity(&state, EntityKind::Job, &id).await
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    common::update_entity(&state, EntityKind::Job, &id, body, false).await
}

pub async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    common::update_entity(&state, EntityKind::Job, &id, body, true).await
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    common::delete_entity(&state, EntityKind::Job, &id).await
}

/// Atomic claim: exactly one concurrent caller gets 204, everyone else 409.
pub async fn handle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let Some(owner) = body.get("owner").and_then(Value::as_str) else {
        return Err(ApiError::validation(&ValidationErrors::single(
            "owner",
            ValidationErrors::required(),
        )));
    };
    handle_job(&state.entities, &id, owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let result = body.get("result").cloned().unwrap_or_else(|| json!({}));
    finish_job(&state.entities, &id, JobOutcome::Done, result).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn fail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let result = body.get("result").cloned().unwrap_or_else(|| json!({}));
    finish_job(&state.entities, &id, JobOutcome::Error, result).await?;
    Ok(StatusCode::NO_CONTENT)
}
