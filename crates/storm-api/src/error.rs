use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use storm_domain::ValidationErrors;
use storm_engine::EngineError;
use storm_store::StoreError;

/// An error ready to cross the API boundary: a status code plus the JSON
/// body the client will see. Validation errors carry a `{field: [messages]}`
/// body; everything else is `{"detail": "..."}` except state-machine
/// conflicts, which use the `{"status": [...]}` shape.
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn validation(errors: &ValidationErrors) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            body: serde_json::to_value(errors).unwrap_or_else(|_| json!({})),
        }
    }

    /// Malformed `?q=` parameter.
    pub fn bad_query(reason: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, body: json!({ "q": [reason.into()] }) }
    }

    pub fn not_found() -> Self {
        ApiError { status: StatusCode::NOT_FOUND, body: json!({ "detail": "Not found." }) }
    }

    /// A job state-machine violation.
    pub fn conflict_status(message: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, body: json!({ "status": [message.into()] }) }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError { status: StatusCode::CONFLICT, body: json!({ "detail": message.into() }) }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({ "detail": message.into() }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ApiError::not_found(),
            StoreError::AmbiguousLookup { .. } => ApiError::conflict(e.to_string()),
            StoreError::Validation(errors) => ApiError::validation(&errors),
            StoreError::BadQuery(reason) => ApiError::bad_query(reason),
            StoreError::Serialization(_) | StoreError::Internal(_) => {
                ApiError::internal(e.to_string())
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Conflict(message) => ApiError::conflict_status(message),
            EngineError::Store(inner) => inner.into(),
        }
    }
}
