use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use storm_domain::{EntityKind, Event};
use storm_query::Query;
use tokio::sync::{watch, RwLock};

use crate::error::StoreError;
use crate::store::{apply_changes, DocumentStore, NewEvent, MAX_EVENTS, MAX_EVENT_BYTES};

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<EntityKind, HashMap<String, Value>>,
    events: VecDeque<(Event, usize)>,
    event_seq: i64,
    event_bytes: usize,
}

impl Inner {
    fn collection(&self, kind: EntityKind) -> Option<&HashMap<String, Value>> {
        self.collections.get(&kind)
    }

    fn collection_mut(&mut self, kind: EntityKind) -> &mut HashMap<String, Value> {
        self.collections.entry(kind).or_default()
    }
}

/// In-memory implementation of [`DocumentStore`].
///
/// All data is lost on process exit. Suitable for tests and ephemeral runs.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    watch_tx: Arc<watch::Sender<i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(-1);
        Self { inner: Arc::new(RwLock::new(Inner::default())), watch_tx: Arc::new(watch_tx) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, kind: EntityKind, doc: Value) -> Result<(), StoreError> {
        let id = doc_id(&doc)?;
        let mut guard = self.inner.write().await;
        guard.collection_mut(kind).insert(id, doc);
        Ok(())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.collection(kind).and_then(|c| c.get(id)).cloned())
    }

    async fn find(&self, kind: EntityKind, query: &Query) -> Result<Vec<Value>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .collection(kind)
            .map(|c| c.values().filter(|doc| query.matches(doc)).cloned().collect())
            .unwrap_or_default())
    }

    async fn replace(&self, kind: EntityKind, id: &str, doc: Value) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let collection = guard.collection_mut(kind);
        if !collection.contains_key(id) {
            return Ok(false);
        }
        collection.insert(id.to_string(), doc);
        Ok(true)
    }

    async fn update_where(
        &self,
        kind: EntityKind,
        id: &str,
        guard_query: &Query,
        changes: &Value,
    ) -> Result<Option<Value>, StoreError> {
        // One write-lock region: the check and the mutation are indivisible.
        let mut guard = self.inner.write().await;
        let Some(doc) = guard.collection_mut(kind).get_mut(id) else {
            return Ok(None);
        };
        if !guard_query.matches(doc) {
            return Ok(None);
        }
        apply_changes(doc, changes);
        Ok(Some(doc.clone()))
    }

    async fn remove(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        Ok(guard.collection_mut(kind).remove(id).is_some())
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let mut guard = self.inner.write().await;
        guard.event_seq += 1;

        let event = Event {
            id: guard.event_seq,
            date: Utc::now(),
            event_type: event.event_type,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            entity_names: event.entity_names,
        };

        let size = serde_json::to_vec(&event)?.len();
        guard.events.push_back((event.clone(), size));
        guard.event_bytes += size;

        // Capped collection: evict oldest first; the counter never resets.
        while guard.events.len() > MAX_EVENTS || guard.event_bytes > MAX_EVENT_BYTES {
            if let Some((_, evicted)) = guard.events.pop_front() {
                guard.event_bytes -= evicted;
            } else {
                break;
            }
        }

        drop(guard);
        let _ = self.watch_tx.send(event.id);
        Ok(event)
    }

    async fn events_slice(&self, start: i64, count: i64) -> Result<Vec<Event>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .events
            .iter()
            .map(|(ev, _)| ev)
            .filter(|ev| ev.id >= start && ev.id < start.saturating_add(count.max(0)))
            .cloned()
            .collect())
    }

    async fn events_tail(&self, count: i64) -> Result<Vec<Event>, StoreError> {
        let guard = self.inner.read().await;
        let skip = guard.events.len().saturating_sub(count.max(0) as usize);
        Ok(guard.events.iter().skip(skip).map(|(ev, _)| ev.clone()).collect())
    }

    async fn events_after(&self, after: i64) -> Result<Vec<Event>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .events
            .iter()
            .map(|(ev, _)| ev)
            .filter(|ev| ev.id > after)
            .cloned()
            .collect())
    }

    async fn last_event_id(&self) -> Result<i64, StoreError> {
        let guard = self.inner.read().await;
        Ok(if guard.event_seq == 0 { -1 } else { guard.event_seq })
    }

    fn watch_events(&self) -> watch::Receiver<i64> {
        self.watch_tx.subscribe()
    }
}

fn doc_id(doc: &Value) -> Result<String, StoreError> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Internal("document has no id".to_string()))
}
