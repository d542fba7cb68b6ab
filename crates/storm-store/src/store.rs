use async_trait::async_trait;
use serde_json::Value;
use storm_domain::{EntityKind, Event, EventType};
use storm_query::Query;
use tokio::sync::watch;

use crate::error::StoreError;

/// Maximum number of events retained in the capped log.
pub const MAX_EVENTS: usize = 10_000;

/// Maximum total serialized size of the capped log.
pub const MAX_EVENT_BYTES: usize = 8 * 1024 * MAX_EVENTS;

/// An event about to be appended. The store allocates the monotonic `id` and
/// stamps `date`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_names: Vec<String>,
}

/// A document-oriented backing store.
///
/// Documents are JSON objects keyed by their `id` field within per-kind
/// collections. The store provides the primitives the coordinator builds on:
/// filtered scans, a single-document atomic conditional update, and an
/// append-only capped event log with an id counter that never resets.
///
/// `update_where` is the only compare-and-swap in the system; backends must
/// make it a single atomic operation (one lock region, one write
/// transaction). Everything else is last-write-wins.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Insert a document. The `id` field must already be set.
    async fn insert(&self, kind: EntityKind, doc: Value) -> Result<(), StoreError>;

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, StoreError>;

    /// All documents of `kind` matching `query`, in storage order.
    async fn find(&self, kind: EntityKind, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// Overwrite the document with the given id. Returns false if it does
    /// not exist.
    async fn replace(&self, kind: EntityKind, id: &str, doc: Value) -> Result<bool, StoreError>;

    /// Atomically: if the document exists and matches `guard`, set each field
    /// in `changes` (a flat object) and return the updated document.
    /// Returns `None` without modifying anything otherwise.
    async fn update_where(
        &self,
        kind: EntityKind,
        id: &str,
        guard: &Query,
        changes: &Value,
    ) -> Result<Option<Value>, StoreError>;

    /// Remove a document. Returns false if it did not exist.
    async fn remove(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError>;

    /// Append an event, allocating the next id from the atomic counter and
    /// evicting the oldest entries if the log is over its caps.
    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError>;

    /// Events with `start <= id < start + count`, ascending.
    async fn events_slice(&self, start: i64, count: i64) -> Result<Vec<Event>, StoreError>;

    /// The last `count` events, ascending.
    async fn events_tail(&self, count: i64) -> Result<Vec<Event>, StoreError>;

    /// Events with `id > after`, ascending. The tailable-cursor read.
    async fn events_after(&self, after: i64) -> Result<Vec<Event>, StoreError>;

    /// Highest event id ever allocated, or -1 when no event was recorded.
    async fn last_event_id(&self) -> Result<i64, StoreError>;

    /// A watch channel carrying the latest event id. Streaming consumers
    /// await changes on it instead of polling.
    fn watch_events(&self) -> watch::Receiver<i64>;
}

/// Apply a flat `changes` object to `doc`, setting each field. A null value
/// sets the field to null rather than removing it.
pub(crate) fn apply_changes(doc: &mut Value, changes: &Value) {
    if let (Some(doc), Some(changes)) = (doc.as_object_mut(), changes.as_object()) {
        for (key, value) in changes {
            doc.insert(key.clone(), value.clone());
        }
    }
}
