//! Shared plumbing for the collection endpoints. Each collection handler is
//! a thin wrapper over these, so list/get/create/update/delete behave
//! identically across entity kinds.

use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use storm_domain::EntityKind;

use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters accepted by every list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// URL-encoded JSON object in the operator dialect.
    pub q: Option<String>,
}

/// Parse the `?q=` parameter. Malformed JSON or a non-object query is a 400
/// with a `{"q": [reason]}` body.
pub fn parse_q(params: &ListParams) -> Result<Option<Value>, ApiError> {
    let Some(raw) = params.q.as_deref().filter(|s| !s.is_empty()) else { return Ok(None) };
    let query: Value =
        serde_json::from_str(raw).map_err(|e| ApiError::bad_query(e.to_string()))?;
    if !query.is_object() {
        return Err(ApiError::bad_query("Query must be a dictionary"));
    }
    Ok(Some(query))
}

pub async fn list_collection(
    state: &AppState,
    kind: EntityKind,
    params: &ListParams,
) -> Result<Json<Value>, ApiError> {
    let user_query = parse_q(params)?;
    let docs = state.entities.list(kind, user_query).await?;
    Ok(Json(Value::Array(docs)))
}

pub async fn get_entity(
    state: &AppState,
    kind: EntityKind,
    id_or_name: &str,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.entities.lookup(kind, id_or_name).await?))
}

pub async fn create_entity(
    state: &AppState,
    kind: EntityKind,
    body: Value,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let doc = state.entities.create(kind, body).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

pub async fn update_entity(
    state: &AppState,
    kind: EntityKind,
    id_or_name: &str,
    body: Value,
    partial: bool,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.entities.update(kind, id_or_name, body, partial).await?))
}

pub async fn delete_entity(
    state: &AppState,
    kind: EntityKind,
    id_or_name: &str,
) -> Result<StatusCode, ApiError> {
    state.entities.delete(kind, id_or_name).await?;
    Ok(StatusCode::NO_CONTENT)
}
