use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use storm_domain::EntityKind;
use storm_engine::sweep_expired_agents;
use tracing::warn;

use crate::error::ApiError;
use crate::handlers::common::{self, ListParams};
use crate::state::AppState;

/// The agent endpoints sweep opportunistically, so a client listing agents
/// always sees liveness at most one sweep interval stale.
async fn sweep(state: &AppState) {
    if let Err(e) = sweep_expired_agents(&state.entities, &state.sweep).await {
        warn!(error = %e, "opportunistic agent sweep failed");
    }
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    sweep(&state).await;
    common::list_collection(&state, EntityKind::Agent, &params).await
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    sweep(&state).await;
    common::get_entity(&state, EntityKind::Agent, &id).await
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    sweep(&state).await;
    common::create_entity(&state, EntityKind::Agent, body).await
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    sweep(&state).await;
    common::update_entity(&state, EntityKind::Agent, &id, body, false).await
}

pub async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    sweep(&state).await;
    common::update_entity(&state, EntityKind::Agent, &id, body, true).await
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    sweep(&state).await;
    common::delete_entity(&state, EntityKind::Agent, &id).await
}

/// Touch the agent's heartbeat. The status is left alone unless the caller
/// sets one explicitly in the body.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<Value>>,
) -> Result<StatusCode, ApiError> {
    let mut patch = json!({ "heartbeat": Utc::now() });
    if let Some(Json(body)) = body {
        if let Some(status) = body.get("status") {
            patch["status"] = status.clone();
        }
    }
    state.entities.update(EntityKind::Agent, &id, patch, true).await?;
    Ok(StatusCode::NO_CONTENT)
}
