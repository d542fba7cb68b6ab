use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use storm_domain::EntityKind;
use storm_engine::{group_members, sweep_expired_agents};
use tracing::warn;

use crate::error::ApiError;
use crate::handlers::common::{self, parse_q, ListParams};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    common::list_collection(&state, EntityKind::Group, &params).await
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    common::get_entity(&state, EntityKind::Group, &id).await
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    common::create_entity(&state, EntityKind::Group, body).await
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    common::update_entity(&state, EntityKind::Group, &id, body, false).await
}

pub async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    common::update_entity(&state, EntityKind::Group, &id, body, true).await
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    common::delete_entity(&state, EntityKind::Group, &id).await
}

/// List the group's current members, optionally narrowed by `?q=`.
pub async fn members(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    if let Err(e) = sweep_expired_agents(&state.entities, &state.sweep).await {
        warn!(error = %e, "opportunistic agent sweep failed");
    }

    let group = state.entities.lookup(EntityKind::Group, &id).await?;
    let extra_filter = parse_q(&params)?;
    let members = group_members(&state.entities, &group, extra_filter).await?;
    Ok(Json(Value::Array(members)))
}

/// Add resources to the group's include/exclude overrides. Values may be
/// ids or names; unknown ones are skipped. Responds with the group's full
/// override lists.
pub async fn add_members(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let group = state.entities.lookup(EntityKind::Group, &id).await?;
    let group_id = group["id"].as_str().unwrap_or_default().to_string();

    let mut include = id_list(&group, "include");
    let mut exclude = id_list(&group, "exclude");
    let before = (include.len(), exclude.len());

    for (field, target) in [("include", &mut include), ("exclude", &mut exclude)] {
        let Some(values) = body.get(field).and_then(Value::as_array) else { continue };
        for value in values {
            let Some(value) = value.as_str() else { continue };
            if let Some(resolved) =
                state.entities.try_resolve_id(EntityKind::Resource, value).await
            {
                if !target.contains(&resolved) {
                    target.push(resolved);
                }
            }
        }
    }

    if (include.len(), exclude.len()) != before {
        state
            .entities
            .update(
                EntityKind::Group,
                &group_id,
                json!({ "include": include, "exclude": exclude }),
                true,
            )
            .await?;
    }

    Ok(Json(json!({ "include": include, "exclude": exclude })))
}

fn id_list(group: &Value, field: &str) -> Vec<String> {
    group
        .get(field)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}
