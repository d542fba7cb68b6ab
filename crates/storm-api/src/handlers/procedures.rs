use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use storm_domain::{EntityKind, ValidationErrors};
use storm_engine::{exec_procedure, ExecRequest};

use crate::error::ApiError;
use crate::handlers::common::{self, ListParams};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    common::list_collection(&state, EntityKind::Procedure, &params).await
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    common::get_entity(&state, EntityKind::Procedure, &id).await
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    common::create_entity(&state, EntityKind::Procedure, body).await
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    common::update_entity(&state, EntityKind::Procedure, &id, body, false).await
}

pub async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    common::update_entity(&state, EntityKind::Procedure, &id, body, true).await
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    common::delete_entity(&state, EntityKind::Procedure, &id).await
}

/// Execute the procedure against a target resource: merge options/params,
/// render the content, enqueue a pending job and return it.
pub async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let target = match body.get("target") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            return Err(ApiError::validation(&ValidationErrors::single(
                "target",
                ValidationErrors::required(),
            )))
        }
    };

    let request = ExecRequest {
        target: Some(target),
        options: body.get("options").cloned().unwrap_or(Value::Null),
        params: body.get("params").cloned().unwrap_or(Value::Null),
    };

    let job = exec_procedure(&state.entities, state.renderer.as_ref(), &id, request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Attach a subscription: whenever an event concerns a member of `group`,
/// this procedure runs against `target`.
pub async fn attach(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let procedure = state.entities.lookup(EntityKind::Procedure, &id).await?;

    let subscription = json!({
        "group": body.get("group").cloned().unwrap_or(Value::Null),
        "procedure": procedure["id"],
        "target": body.get("target").cloned().unwrap_or(Value::Null),
        "options": body.get("options").cloned().unwrap_or_else(|| json!({})),
        "params": body.get("params").cloned().unwrap_or_else(|| json!({})),
    });

    let created = state.entities.create(EntityKind::Subscription, subscription).await?;
    Ok((StatusCode::CREATED, Json(created)))
}
