use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] storm_store::StoreError),

    /// A state-machine violation: handle on a non-pending job, complete or
    /// fail on a non-running one. Maps to 409 at the API boundary.
    #[error("{0}")]
    Conflict(String),
}
