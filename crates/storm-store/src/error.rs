use storm_domain::{EntityKind, ValidationErrors};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{} matching \"{value}\" does not exist", kind.entity_type())]
    NotFound { kind: EntityKind, value: String },

    #[error("multiple {}s match \"{value}\"", kind.entity_type())]
    AmbiguousLookup { kind: EntityKind, value: String },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("malformed query: {0}")]
    BadQuery(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<storm_query::QueryError> for StoreError {
    fn from(e: storm_query::QueryError) -> Self {
        StoreError::BadQuery(e.to_string())
    }
}
