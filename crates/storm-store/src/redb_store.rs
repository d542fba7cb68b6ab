use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde_json::Value;
use storm_domain::{EntityKind, Event};
use storm_query::Query;
use tokio::sync::watch;

use crate::error::StoreError;
use crate::store::{apply_changes, DocumentStore, NewEvent, MAX_EVENTS, MAX_EVENT_BYTES};

// Documents are keyed "kind/id"; ids never contain '/'.
const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
const EVENTS: TableDefinition<i64, &[u8]> = TableDefinition::new("events");
const META: TableDefinition<&str, i64> = TableDefinition::new("meta");

const EVENT_SEQ: &str = "event_seq";
const EVENT_BYTES: &str = "event_bytes";

fn internal(e: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// Persistent [`DocumentStore`] backed by a redb database file.
///
/// Every conditional update runs inside a single write transaction, which is
/// what gives the job claim its at-most-one guarantee. The event counter
/// lives in the database, so ids stay monotonic across restarts.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    watch_tx: Arc<watch::Sender<i64>>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;

        // Ensure tables exist and learn the persisted counter.
        let last_id;
        {
            let wtxn = db.begin_write().map_err(internal)?;
            {
                wtxn.open_table(ENTITIES).map_err(internal)?;
                wtxn.open_table(EVENTS).map_err(internal)?;
                let meta = wtxn.open_table(META).map_err(internal)?;
                last_id = meta
                    .get(EVENT_SEQ)
                    .map_err(internal)?
                    .map(|g| g.value())
                    .unwrap_or(0);
            }
            wtxn.commit().map_err(internal)?;
        }

        let (watch_tx, _) = watch::channel(if last_id == 0 { -1 } else { last_id });
        Ok(Self { db: Arc::new(db), watch_tx: Arc::new(watch_tx) })
    }

    fn key(kind: EntityKind, id: &str) -> String {
        format!("{}/{}", kind.entity_type(), id)
    }
}

#[async_trait]
impl DocumentStore for RedbStore {
    async fn insert(&self, kind: EntityKind, doc: Value) -> Result<(), StoreError> {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Internal("document has no id".to_string()))?
            .to_string();
        let bytes = serde_json::to_vec(&doc)?;

        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(ENTITIES).map_err(internal)?;
            table
                .insert(Self::key(kind, &id).as_str(), bytes.as_slice())
                .map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(ENTITIES).map_err(internal)?;
        match table.get(Self::key(kind, id).as_str()).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn find(&self, kind: EntityKind, query: &Query) -> Result<Vec<Value>, StoreError> {
        let prefix = format!("{}/", kind.entity_type());
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(ENTITIES).map_err(internal)?;

        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(internal)? {
            let (k, v) = entry.map_err(internal)?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            let doc: Value = serde_json::from_slice(v.value())?;
            if query.matches(&doc) {
                results.push(doc);
            }
        }
        Ok(results)
    }

    async fn replace(&self, kind: EntityKind, id: &str, doc: Value) -> Result<bool, StoreError> {
        let bytes = serde_json::to_vec(&doc)?;
        let key = Self::key(kind, id);

        let wtxn = self.db.begin_write().map_err(internal)?;
        let existed;
        {
            let mut table = wtxn.open_table(ENTITIES).map_err(internal)?;
            existed = table.get(key.as_str()).map_err(internal)?.is_some();
            if existed {
                table.insert(key.as_str(), bytes.as_slice()).map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(existed)
    }

    async fn update_where(
        &self,
        kind: EntityKind,
        id: &str,
        guard: &Query,
        changes: &Value,
    ) -> Result<Option<Value>, StoreError> {
        let key = Self::key(kind, id);

        // One write transaction: redb's single-writer model makes the
        // read-check-write indivisible.
        let wtxn = self.db.begin_write().map_err(internal)?;
        let updated;
        {
            let mut table = wtxn.open_table(ENTITIES).map_err(internal)?;
            let current_bytes = match table.get(key.as_str()).map_err(internal)? {
                Some(g) => Some(serde_json::from_slice::<Value>(g.value())?),
                None => None,
            };
            let current = match current_bytes {
                Some(c) => c,
                None => {
                    drop(table);
                    wtxn.abort().map_err(internal)?;
                    return Ok(None);
                }
            };
            if !guard.matches(&current) {
                drop(table);
                wtxn.abort().map_err(internal)?;
                return Ok(None);
            }
            let mut doc = current;
            apply_changes(&mut doc, changes);
            let bytes = serde_json::to_vec(&doc)?;
            table.insert(key.as_str(), bytes.as_slice()).map_err(internal)?;
            updated = doc;
        }
        wtxn.commit().map_err(internal)?;
        Ok(Some(updated))
    }

    async fn remove(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let existed;
        {
            let mut table = wtxn.open_table(ENTITIES).map_err(internal)?;
            existed = table.remove(Self::key(kind, id).as_str()).map_err(internal)?.is_some();
        }
        wtxn.commit().map_err(internal)?;
        Ok(existed)
    }

    async fn append_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let stored;
        {
            let mut meta = wtxn.open_table(META).map_err(internal)?;
            let seq = meta.get(EVENT_SEQ).map_err(internal)?.map(|g| g.value()).unwrap_or(0) + 1;
            meta.insert(EVENT_SEQ, seq).map_err(internal)?;

            stored = Event {
                id: seq,
                date: Utc::now(),
                event_type: event.event_type,
                entity_type: event.entity_type,
                entity_id: event.entity_id,
                entity_names: event.entity_names,
            };
            let bytes = serde_json::to_vec(&stored)?;

            let mut total =
                meta.get(EVENT_BYTES).map_err(internal)?.map(|g| g.value()).unwrap_or(0)
                    + bytes.len() as i64;

            let mut events = wtxn.open_table(EVENTS).map_err(internal)?;
            events.insert(seq, bytes.as_slice()).map_err(internal)?;

            // Enforce the caps inside the same transaction.
            while events.len().map_err(internal)? as usize > MAX_EVENTS
                || total > MAX_EVENT_BYTES as i64
            {
                match events.pop_first().map_err(internal)? {
                    Some((_, v)) => total -= v.value().len() as i64,
                    None => break,
                }
            }
            meta.insert(EVENT_BYTES, total).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;

        let _ = self.watch_tx.send(stored.id);
        Ok(stored)
    }

    async fn events_slice(&self, start: i64, count: i64) -> Result<Vec<Event>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(EVENTS).map_err(internal)?;
        let end = start.saturating_add(count.max(0));
        let mut results = Vec::new();
        for entry in table.range(start..end).map_err(internal)? {
            let (_, v) = entry.map_err(internal)?;
            results.push(serde_json::from_slice(v.value())?);
        }
        Ok(results)
    }

    async fn events_tail(&self, count: i64) -> Result<Vec<Event>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(EVENTS).map_err(internal)?;
        let mut results: Vec<Event> = Vec::new();
        for entry in table.iter().map_err(internal)?.rev().take(count.max(0) as usize) {
            let (_, v) = entry.map_err(internal)?;
            results.push(serde_json::from_slice(v.value())?);
        }
        results.reverse();
        Ok(results)
    }

    async fn events_after(&self, after: i64) -> Result<Vec<Event>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(EVENTS).map_err(internal)?;
        let mut results = Vec::new();
        for entry in table.range(after.saturating_add(1)..).map_err(internal)? {
            let (_, v) = entry.map_err(internal)?;
            results.push(serde_json::from_slice(v.value())?);
        }
        Ok(results)
    }

    async fn last_event_id(&self) -> Result<i64, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let meta = rtxn.open_table(META).map_err(internal)?;
        let seq = meta.get(EVENT_SEQ).map_err(internal)?.map(|g| g.value()).unwrap_or(0);
        Ok(if seq == 0 { -1 } else { seq })
    }

    fn watch_events(&self) -> watch::Receiver<i64> {
        self.watch_tx.subscribe()
    }
}
