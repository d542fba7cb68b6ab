//! Typed facade over the raw document store.
//!
//! All entity reads and writes go through here: validation, unique-name
//! enforcement, id-or-name lookup, reference resolution in user queries,
//! cascade policies on delete, and event emission for every successful
//! mutation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use storm_domain::{
    escape_keys, unescape_keys, Agent, Application, EntityKind, EventType, Group, Job, Procedure,
    Resource, Subscription, ValidationErrors,
};
use storm_query::{parse, sanitize, FieldCond, Query};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{DocumentStore, NewEvent};
use crate::validate;

/// An equality query on a single field. List-valued fields match by element,
/// so this also finds documents whose array field contains `value`.
fn field_eq(path: &str, value: &str) -> Query {
    Query::Field { path: path.to_string(), cond: FieldCond::Eq(Value::String(value.to_string())) }
}

#[derive(Clone)]
pub struct EntityStore {
    db: Arc<dyn DocumentStore>,
}

impl EntityStore {
    pub fn new(db: Arc<dyn DocumentStore>) -> Self {
        Self { db }
    }

    /// The raw document store, for event-log reads and conditional updates.
    pub fn db(&self) -> &Arc<dyn DocumentStore> {
        &self.db
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// List all documents of `kind`, optionally filtered by a user query in
    /// the operator dialect, in the kind's canonical order.
    pub async fn list(
        &self,
        kind: EntityKind,
        user_query: Option<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        let query = match user_query {
            Some(q) => {
                let prepared = self.prepare_user_query(kind, q).await?;
                parse(&prepared)?
            }
            None => Query::All,
        };
        self.find_sorted(kind, &query).await
    }

    /// Run an already-parsed query and return unescaped documents in the
    /// kind's canonical order.
    pub async fn find_sorted(
        &self,
        kind: EntityKind,
        query: &Query,
    ) -> Result<Vec<Value>, StoreError> {
        let mut docs = self.db.find(kind, query).await?;
        sort_docs(kind, &mut docs);
        Ok(docs.into_iter().map(|d| from_storage(kind, d)).collect())
    }

    /// Fetch one entity by id or by any of its kind's lookup fields. The id
    /// is always tried first, then the lookup fields in declared order.
    pub async fn lookup(&self, kind: EntityKind, value: &str) -> Result<Value, StoreError> {
        if let Some(doc) = self.db.get(kind, value).await? {
            return Ok(from_storage(kind, doc));
        }

        let fields = kind.lookup_fields();
        if fields.is_empty() {
            return Err(StoreError::NotFound { kind, value: value.to_string() });
        }

        let mut branches: Vec<Query> = fields.iter().map(|f| field_eq(f, value)).collect();
        let query =
            if branches.len() == 1 { branches.pop().expect("len checked") } else { Query::Or(branches) };

        let mut matches = self.db.find(kind, &query).await?;
        match matches.len() {
            0 => Err(StoreError::NotFound { kind, value: value.to_string() }),
            1 => Ok(from_storage(kind, matches.pop().expect("len checked"))),
            _ => Err(StoreError::AmbiguousLookup { kind, value: value.to_string() }),
        }
    }

    /// Resolve an id-or-name to an id, or `None` when nothing (or more than
    /// one thing) matches.
    pub async fn try_resolve_id(&self, kind: EntityKind, value: &str) -> Option<String> {
        self.lookup(kind, value)
            .await
            .ok()
            .and_then(|doc| doc.get("id").and_then(Value::as_str).map(str::to_string))
    }

    pub(crate) async fn name_taken(
        &self,
        kind: EntityKind,
        name: &str,
        self_id: &str,
    ) -> Result<bool, StoreError> {
        let matches = self.db.find(kind, &field_eq("name", name)).await?;
        Ok(matches.iter().any(|doc| doc.get("id").and_then(Value::as_str) != Some(self_id)))
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    /// Create an entity from a client-supplied body. Generates the id,
    /// validates, resolves references, persists and emits a `created` event.
    pub async fn create(&self, kind: EntityKind, body: Value) -> Result<Value, StoreError> {
        let mut doc = into_object(body)?;
        for field in validate::read_only_on_create(kind) {
            doc.remove(*field);
        }

        let id = kind.new_id();
        doc.insert("id".to_string(), Value::String(id.0.clone()));

        validate::validate(self, kind, &mut doc, id.as_str()).await?;
        let normalized = normalize(kind, Value::Object(doc))?;

        self.db.insert(kind, to_storage(kind, normalized.clone())).await?;
        self.record_event(EventType::Created, kind, &normalized).await?;
        Ok(normalized)
    }

    /// Insert an internally constructed, already-valid document (job exec,
    /// subscription attach). Still normalizes and emits a `created` event.
    pub async fn insert_prepared(
        &self,
        kind: EntityKind,
        doc: Value,
    ) -> Result<Value, StoreError> {
        let normalized = normalize(kind, doc)?;
        self.db.insert(kind, to_storage(kind, normalized.clone())).await?;
        self.record_event(EventType::Created, kind, &normalized).await?;
        Ok(normalized)
    }

    /// Update an entity. With `partial` the body is merged over the stored
    /// document (PATCH); otherwise the body replaces it and unspecified
    /// optional fields reset to their defaults (PUT). Read-only fields are
    /// silently dropped from the body either way.
    pub async fn update(
        &self,
        kind: EntityKind,
        id_or_name: &str,
        body: Value,
        partial: bool,
    ) -> Result<Value, StoreError> {
        let current = self.lookup(kind, id_or_name).await?;
        let id = doc_id(&current)?;

        let mut patch = into_object(body)?;
        for field in validate::read_only_on_update(kind) {
            patch.remove(*field);
        }

        let mut doc = if partial {
            let mut doc = into_object(current.clone())?;
            for (key, value) in patch {
                doc.insert(key, value);
            }
            doc
        } else {
            patch
        };

        // Read-only fields always come from the stored document.
        let current_map = current.as_object().expect("stored documents are objects");
        for field in validate::read_only_on_update(kind) {
            if let Some(value) = current_map.get(*field) {
                doc.insert(field.to_string(), value.clone());
            }
        }

        validate::validate(self, kind, &mut doc, &id).await?;
        let normalized = normalize(kind, Value::Object(doc))?;

        self.db.replace(kind, &id, to_storage(kind, normalized.clone())).await?;
        self.record_event(EventType::Updated, kind, &normalized).await?;

        // An agent saved offline releases everything it was working on.
        if kind == EntityKind::Agent
            && normalized.get("status").and_then(Value::as_str) == Some("offline")
        {
            self.requeue_jobs_for(&id).await?;
        }

        Ok(normalized)
    }

    /// Delete an entity and apply its kind's cascade policy. One event per
    /// affected entity.
    pub async fn delete(&self, kind: EntityKind, id_or_name: &str) -> Result<(), StoreError> {
        let doc = self.lookup(kind, id_or_name).await?;
        self.delete_doc(kind, doc).await
    }

    // Cascades recurse (agent → resource → job), so the future is boxed.
    fn delete_doc<'a>(
        &'a self,
        kind: EntityKind,
        doc: Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let id = doc_id(&doc)?;

            match kind {
                EntityKind::Agent => {
                    // Owned resources go with the agent; owned jobs go back
                    // to the queue.
                    let owned =
                        self.find_sorted(EntityKind::Resource, &field_eq("owner", &id)).await?;
                    for resource in owned {
                        self.delete_doc(EntityKind::Resource, resource).await?;
                    }
                    self.requeue_jobs_for(&id).await?;
                }
                EntityKind::Resource => {
                    // Pulled from group overrides, never cascading to the group.
                    let referencing =
                        Query::Or(vec![field_eq("include", &id), field_eq("exclude", &id)]);
                    for mut group in self.db.find(EntityKind::Group, &referencing).await? {
                        pull_from_array(&mut group, "include", &id);
                        pull_from_array(&mut group, "exclude", &id);
                        let group_id = doc_id(&group)?;
                        self.db.replace(EntityKind::Group, &group_id, group.clone()).await?;
                        self.record_event(
                            EventType::Updated,
                            EntityKind::Group,
                            &from_storage(EntityKind::Group, group),
                        )
                        .await?;
                    }
                    for job in self.find_sorted(EntityKind::Job, &field_eq("target", &id)).await? {
                        self.delete_doc(EntityKind::Job, job).await?;
                    }
                }
                EntityKind::Group => {
                    for sub in
                        self.find_sorted(EntityKind::Subscription, &field_eq("group", &id)).await?
                    {
                        self.delete_doc(EntityKind::Subscription, sub).await?;
                    }
                    for mut app in
                        self.db.find(EntityKind::Application, &field_eq("components", &id)).await?
                    {
                        pull_from_array(&mut app, "components", &id);
                        pull_group_links(&mut app, &id);
                        let app_id = doc_id(&app)?;
                        self.db.replace(EntityKind::Application, &app_id, app.clone()).await?;
                        self.record_event(
                            EventType::Updated,
                            EntityKind::Application,
                            &from_storage(EntityKind::Application, app),
                        )
                        .await?;
                    }
                }
                EntityKind::Procedure => {
                    for job in
                        self.find_sorted(EntityKind::Job, &field_eq("procedure", &id)).await?
                    {
                        self.delete_doc(EntityKind::Job, job).await?;
                    }
                    for sub in self
                        .find_sorted(EntityKind::Subscription, &field_eq("procedure", &id))
                        .await?
                    {
                        self.delete_doc(EntityKind::Subscription, sub).await?;
                    }
                }
                EntityKind::Application | EntityKind::Job | EntityKind::Subscription => {}
            }

            self.db.remove(kind, &id).await?;
            self.record_event(EventType::Deleted, kind, &doc).await?;
            Ok(())
        })
    }

    /// Put every job owned by `agent_id` back in the queue. Each requeue is
    /// conditional on the ownership still holding, so a completion racing
    /// with the requeue cannot be clobbered.
    pub async fn requeue_jobs_for(&self, agent_id: &str) -> Result<(), StoreError> {
        let owner_guard = field_eq("owner", agent_id);
        let jobs = self.db.find(EntityKind::Job, &owner_guard).await?;
        for job in jobs {
            let job_id = doc_id(&job)?;
            let requeued = self
                .db
                .update_where(
                    EntityKind::Job,
                    &job_id,
                    &owner_guard,
                    &json!({"status": "pending", "owner": null}),
                )
                .await?;
            if let Some(updated) = requeued {
                debug!(job_id = %job_id, agent_id = %agent_id, "requeued orphaned job");
                self.record_event(EventType::Updated, EntityKind::Job, &from_storage(EntityKind::Job, updated))
                    .await?;
            }
        }
        Ok(())
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Append one event for a successful mutation. The engine also uses this
    /// for the conditional updates that bypass the normal write paths.
    pub async fn record_event(
        &self,
        event_type: EventType,
        kind: EntityKind,
        doc: &Value,
    ) -> Result<(), StoreError> {
        let entity_names = match kind {
            EntityKind::Resource => doc
                .get("names")
                .and_then(Value::as_array)
                .map(|items| {
                    items.iter().filter_map(Value::as_str).map(str::to_string).collect()
                })
                .unwrap_or_default(),
            EntityKind::Job | EntityKind::Subscription => Vec::new(),
            _ => doc
                .get("name")
                .and_then(Value::as_str)
                .map(|n| vec![n.to_string()])
                .unwrap_or_default(),
        };

        self.db
            .append_event(NewEvent {
                event_type,
                entity_type: kind.entity_type().to_string(),
                entity_id: doc_id(doc)?,
                entity_names,
            })
            .await?;
        Ok(())
    }

    // ── User queries ──────────────────────────────────────────────────────────

    /// Prepare a user query for evaluation: strip forbidden keys, then
    /// resolve reference-valued fields given as names to ids. Clauses whose
    /// reference cannot be resolved are dropped, never failed.
    pub async fn prepare_user_query(
        &self,
        kind: EntityKind,
        mut query: Value,
    ) -> Result<Value, StoreError> {
        if !query.is_object() {
            return Err(StoreError::BadQuery("Query must be a dictionary".to_string()));
        }
        sanitize(&mut query);

        let mut wanted: Vec<(EntityKind, String)> = Vec::new();
        collect_query_refs(kind, &query, &mut wanted);

        let mut resolved: HashMap<(EntityKind, String), Option<String>> = HashMap::new();
        for (target, value) in wanted {
            if !resolved.contains_key(&(target, value.clone())) {
                let id = self.try_resolve_id(target, &value).await;
                resolved.insert((target, value), id);
            }
        }

        substitute_query_refs(kind, &mut query, &resolved);
        Ok(query)
    }
}

// ── Document plumbing ─────────────────────────────────────────────────────────

fn doc_id(doc: &Value) -> Result<String, StoreError> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Internal("document has no id".to_string()))
}

fn into_object(body: Value) -> Result<Map<String, Value>, StoreError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::Validation(ValidationErrors::single(
            "non_field_errors",
            "Invalid data. Expected a dictionary.",
        ))),
    }
}

/// Escape the free-form map fields before they reach the backing store.
fn to_storage(kind: EntityKind, mut doc: Value) -> Value {
    if let Some(map) = doc.as_object_mut() {
        for field in kind.escaped_fields() {
            if let Some(value) = map.remove(*field) {
                map.insert(field.to_string(), escape_keys(value));
            }
        }
    }
    doc
}

/// Inverse of [`to_storage`], applied on every read path.
fn from_storage(kind: EntityKind, mut doc: Value) -> Value {
    if let Some(map) = doc.as_object_mut() {
        for field in kind.escaped_fields() {
            if let Some(value) = map.remove(*field) {
                map.insert(field.to_string(), unescape_keys(value));
            }
        }
    }
    doc
}

/// Round-trip a document through its typed struct: applies defaults, drops
/// unknown fields and puts the stored form in a canonical shape.
fn normalize(kind: EntityKind, doc: Value) -> Result<Value, StoreError> {
    fn round_trip<T: serde::de::DeserializeOwned + serde::Serialize>(
        doc: Value,
    ) -> Result<Value, StoreError> {
        let typed: T = serde_json::from_value(doc).map_err(|e| {
            StoreError::Validation(ValidationErrors::single("non_field_errors", e.to_string()))
        })?;
        Ok(serde_json::to_value(typed)?)
    }

    match kind {
        EntityKind::Agent => round_trip::<Agent>(doc),
        EntityKind::Resource => round_trip::<Resource>(doc),
        EntityKind::Group => round_trip::<Group>(doc),
        EntityKind::Application => round_trip::<Application>(doc),
        EntityKind::Procedure => round_trip::<Procedure>(doc),
        EntityKind::Job => round_trip::<Job>(doc),
        EntityKind::Subscription => round_trip::<Subscription>(doc),
    }
}

fn pull_from_array(doc: &mut Value, field: &str, id: &str) {
    if let Some(items) = doc.get_mut(field).and_then(Value::as_array_mut) {
        items.retain(|v| v.as_str() != Some(id));
    }
}

/// Drop links and exposed services that reference a group being removed from
/// an application's components.
fn pull_group_links(app: &mut Value, group_id: &str) {
    if let Some(links) = app.get_mut("links").and_then(Value::as_array_mut) {
        links.retain(|link| {
            link.get("from_component").and_then(Value::as_str) != Some(group_id)
                && link
                    .pointer("/to_service/group")
                    .and_then(Value::as_str)
                    != Some(group_id)
        });
    }
    if let Some(expose) = app.get_mut("expose").and_then(Value::as_array_mut) {
        expose.retain(|sref| sref.get("group").and_then(Value::as_str) != Some(group_id));
    }
}

fn collect_query_refs(kind: EntityKind, value: &Value, out: &mut Vec<(EntityKind, String)>) {
    let Some(map) = value.as_object() else { return };
    for (key, v) in map {
        if key.starts_with('$') {
            match v {
                Value::Array(items) => {
                    items.iter().for_each(|item| collect_query_refs(kind, item, out))
                }
                other => collect_query_refs(kind, other, out),
            }
        } else if let Some((_, target)) =
            kind.reference_fields().iter().find(|(field, _)| *field == key.as_str())
        {
            if let Some(s) = v.as_str() {
                out.push((*target, s.to_string()));
            }
        }
    }
}

fn substitute_query_refs(
    kind: EntityKind,
    value: &mut Value,
    resolved: &HashMap<(EntityKind, String), Option<String>>,
) {
    let Some(map) = value.as_object_mut() else { return };

    let mut dropped = Vec::new();
    for (key, v) in map.iter_mut() {
        if key.starts_with('$') {
            match v {
                Value::Array(items) => items
                    .iter_mut()
                    .for_each(|item| substitute_query_refs(kind, item, resolved)),
                other => substitute_query_refs(kind, other, resolved),
            }
        } else if let Some((_, target)) =
            kind.reference_fields().iter().find(|(field, _)| *field == key.as_str())
        {
            if let Some(s) = v.as_str() {
                match resolved.get(&(*target, s.to_string())).and_then(Clone::clone) {
                    Some(id) => *v = Value::String(id),
                    // Unresolvable reference: the clause is dropped so the
                    // query still runs.
                    None => dropped.push(key.clone()),
                }
            }
        }
    }
    for key in dropped {
        map.remove(&key);
    }
}

fn sort_docs(kind: EntityKind, docs: &mut [Value]) {
    let str_key = |doc: &Value, field: &str| {
        doc.get(field).and_then(Value::as_str).map(str::to_string)
    };

    match kind {
        EntityKind::Job => docs.sort_by_key(|doc| {
            let created = doc
                .get("created")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
            (created, str_key(doc, "id"))
        }),
        EntityKind::Resource => docs.sort_by_key(|doc| {
            let first_name = doc
                .get("names")
                .and_then(Value::as_array)
                .and_then(|ns| ns.first())
                .and_then(Value::as_str)
                .map(str::to_string);
            (str_key(doc, "type"), first_name, str_key(doc, "id"))
        }),
        EntityKind::Subscription => docs.sort_by_key(|doc| str_key(doc, "id")),
        _ => docs.sort_by_key(|doc| {
            // Named entities sort by name with unnamed ones last.
            let name = str_key(doc, "name");
            (name.is_none(), name, str_key(doc, "id"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use storm_domain::EventType;

    fn entities() -> EntityStore {
        EntityStore::new(Arc::new(MemoryStore::new()))
    }

    async fn create_agent(store: &EntityStore, name: Option<&str>) -> Value {
        let mut body = json!({"type": "test"});
        if let Some(name) = name {
            body["name"] = json!(name);
        }
        store.create(EntityKind::Agent, body).await.unwrap()
    }

    async fn create_resource(store: &EntityStore, owner: &str, names: Value) -> Value {
        store
            .create(
                EntityKind::Resource,
                json!({"type": "container", "owner": owner, "names": names}),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_generates_prefixed_id_and_defaults() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let id = agent["id"].as_str().unwrap();
        assert!(id.starts_with("agt-"));
        assert_eq!(id.len(), 26);
        assert_eq!(agent["status"], "offline");
    }

    #[tokio::test]
    async fn create_emits_created_event() {
        let store = entities();
        let agent = create_agent(&store, Some("worker")).await;
        let events = store.db().events_after(-1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Created);
        assert_eq!(events[0].entity_type, "agent");
        assert_eq!(events[0].entity_id, agent["id"].as_str().unwrap());
        assert_eq!(events[0].entity_names, vec!["worker".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let store = entities();
        create_agent(&store, Some("worker")).await;
        let err = store
            .create(EntityKind::Agent, json!({"type": "test", "name": "worker"}))
            .await
            .unwrap_err();
        match err {
            StoreError::Validation(errors) => {
                assert!(errors.fields.contains_key("name"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_type_is_a_field_error() {
        let store = entities();
        let err = store.create(EntityKind::Agent, json!({})).await.unwrap_err();
        match err {
            StoreError::Validation(errors) => {
                assert_eq!(errors.fields["type"], vec!["This field is required."]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn lookup_tries_id_then_names() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let agent_id = agent["id"].as_str().unwrap();
        let resource = create_resource(&store, agent_id, json!(["web-1", "web-1.example.org"])).await;

        let by_id = store
            .lookup(EntityKind::Resource, resource["id"].as_str().unwrap())
            .await
            .unwrap();
        let by_name = store.lookup(EntityKind::Resource, "web-1.example.org").await.unwrap();
        assert_eq!(by_id["id"], by_name["id"]);
    }

    #[tokio::test]
    async fn ambiguous_lookup_fails() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let agent_id = agent["id"].as_str().unwrap();
        create_resource(&store, agent_id, json!(["dup"])).await;
        create_resource(&store, agent_id, json!(["dup"])).await;

        let err = store.lookup(EntityKind::Resource, "dup").await.unwrap_err();
        assert!(matches!(err, StoreError::AmbiguousLookup { .. }));
    }

    #[tokio::test]
    async fn unknown_reference_is_a_validation_error() {
        let store = entities();
        let err = store
            .create(EntityKind::Resource, json!({"type": "t", "owner": "agt-missing"}))
            .await
            .unwrap_err();
        match err {
            StoreError::Validation(errors) => assert!(errors.fields.contains_key("owner")),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn owner_name_resolves_to_id() {
        let store = entities();
        let agent = create_agent(&store, Some("worker")).await;
        let resource = store
            .create(EntityKind::Resource, json!({"type": "t", "owner": "worker"}))
            .await
            .unwrap();
        assert_eq!(resource["owner"], agent["id"]);
    }

    #[tokio::test]
    async fn agent_delete_cascades_resources_and_requeues_jobs() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let agent_id = agent["id"].as_str().unwrap().to_string();
        let resource = create_resource(&store, &agent_id, json!(["r1"])).await;

        // A running job owned by the agent, targeting a resource of another
        // agent so the cascade doesn't delete it.
        let other = create_agent(&store, None).await;
        let other_id = other["id"].as_str().unwrap();
        let target = create_resource(&store, other_id, json!(["t1"])).await;
        let job = store
            .insert_prepared(
                EntityKind::Job,
                json!({
                    "id": EntityKind::Job.new_id(),
                    "type": "shell",
                    "target": target["id"],
                    "status": "running",
                    "owner": agent_id,
                }),
            )
            .await
            .unwrap();

        store.delete(EntityKind::Agent, &agent_id).await.unwrap();

        let err = store
            .lookup(EntityKind::Resource, resource["id"].as_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let job = store.lookup(EntityKind::Job, job["id"].as_str().unwrap()).await.unwrap();
        assert_eq!(job["status"], "pending");
        assert!(job["owner"].is_null());
    }

    #[tokio::test]
    async fn resource_delete_pulls_group_overrides() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let agent_id = agent["id"].as_str().unwrap();
        let keep = create_resource(&store, agent_id, json!(["keep"])).await;
        let gone = create_resource(&store, agent_id, json!(["gone"])).await;

        let group = store
            .create(
                EntityKind::Group,
                json!({
                    "name": "g",
                    "query": {},
                    "include": [keep["id"], gone["id"]],
                    "exclude": [gone["id"]],
                }),
            )
            .await
            .unwrap();

        store.delete(EntityKind::Resource, gone["id"].as_str().unwrap()).await.unwrap();

        let group = store
            .lookup(EntityKind::Group, group["id"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(group["include"], json!([keep["id"].as_str().unwrap()]));
        assert_eq!(group["exclude"], json!([]));
    }

    #[tokio::test]
    async fn procedure_delete_cascades_jobs_and_subscriptions() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let agent_id = agent["id"].as_str().unwrap();
        let target = create_resource(&store, agent_id, json!(["t"])).await;
        let procedure = store
            .create(EntityKind::Procedure, json!({"type": "shell", "content": "x"}))
            .await
            .unwrap();
        let group = store
            .create(EntityKind::Group, json!({"name": "g", "query": {}}))
            .await
            .unwrap();

        let job = store
            .insert_prepared(
                EntityKind::Job,
                json!({
                    "id": EntityKind::Job.new_id(),
                    "type": "shell",
                    "target": target["id"],
                    "procedure": procedure["id"],
                }),
            )
            .await
            .unwrap();
        let sub = store
            .insert_prepared(
                EntityKind::Subscription,
                json!({
                    "id": EntityKind::Subscription.new_id(),
                    "group": group["id"],
                    "procedure": procedure["id"],
                }),
            )
            .await
            .unwrap();

        store.delete(EntityKind::Procedure, procedure["id"].as_str().unwrap()).await.unwrap();

        assert!(store.lookup(EntityKind::Job, job["id"].as_str().unwrap()).await.is_err());
        assert!(store
            .lookup(EntityKind::Subscription, sub["id"].as_str().unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn group_delete_pulls_application_components() {
        let store = entities();
        let g1 = store
            .create(
                EntityKind::Group,
                json!({"name": "g1", "query": {}, "services": [{"name": "http", "protocol": "tcp", "port": 80}]}),
            )
            .await
            .unwrap();
        let g2 = store
            .create(EntityKind::Group, json!({"name": "g2", "query": {}}))
            .await
            .unwrap();

        let app = store
            .create(
                EntityKind::Application,
                json!({
                    "name": "app",
                    "components": [g1["id"], g2["id"]],
                    "links": [
                        {"from_component": "g2", "to_service": {"group": "g1", "service_name": "http"}}
                    ],
                    "expose": [{"group": "g1", "service_name": "http"}],
                }),
            )
            .await
            .unwrap();

        store.delete(EntityKind::Group, g1["id"].as_str().unwrap()).await.unwrap();

        let app = store
            .lookup(EntityKind::Application, app["id"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(app["components"], json!([g2["id"].as_str().unwrap()]));
        assert_eq!(app["links"], json!([]));
        assert_eq!(app["expose"], json!([]));
    }

    #[tokio::test]
    async fn link_endpoints_must_be_components() {
        let store = entities();
        let g1 = store
            .create(EntityKind::Group, json!({"name": "g1", "query": {}}))
            .await
            .unwrap();
        let outside = store
            .create(
                EntityKind::Group,
                json!({"name": "outside", "query": {}, "services": [{"name": "s", "protocol": "tcp", "port": 1}]}),
            )
            .await
            .unwrap();
        let _ = (g1, outside);

        let err = store
            .create(
                EntityKind::Application,
                json!({
                    "name": "app",
                    "components": ["g1"],
                    "links": [
                        {"from_component": "g1", "to_service": {"group": "outside", "service_name": "s"}}
                    ],
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn snapshot_keys_round_trip_through_escaping() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let resource = store
            .create(
                EntityKind::Resource,
                json!({
                    "type": "t",
                    "owner": agent["id"],
                    "snapshot": {"docker.io/image": {"$tag": "latest"}},
                }),
            )
            .await
            .unwrap();

        let loaded = store
            .lookup(EntityKind::Resource, resource["id"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded["snapshot"], json!({"docker.io/image": {"$tag": "latest"}}));

        // The stored form must not contain the forbidden characters.
        let raw = store
            .db()
            .get(EntityKind::Resource, resource["id"].as_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        let keys: Vec<&String> = raw["snapshot"].as_object().unwrap().keys().collect();
        assert!(keys.iter().all(|k| !k.contains(['$', '.'])));
    }

    #[tokio::test]
    async fn user_query_resolves_reference_names() {
        let store = entities();
        let agent = create_agent(&store, Some("worker")).await;
        let agent_id = agent["id"].as_str().unwrap();
        create_resource(&store, agent_id, json!(["r1"])).await;

        let other = create_agent(&store, Some("other")).await;
        create_resource(&store, other["id"].as_str().unwrap(), json!(["r2"])).await;

        let found = store
            .list(EntityKind::Resource, Some(json!({"owner": "worker"})))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["names"], json!(["r1"]));
    }

    #[tokio::test]
    async fn unresolvable_reference_clause_is_dropped() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        create_resource(&store, agent["id"].as_str().unwrap(), json!(["r1"])).await;

        // Owner clause drops, type clause still applies.
        let found = store
            .list(
                EntityKind::Resource,
                Some(json!({"owner": "no-such-agent", "type": "container"})),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn update_merges_and_emits_updated() {
        let store = entities();
        let agent = create_agent(&store, Some("worker")).await;
        let id = agent["id"].as_str().unwrap();

        let updated = store
            .update(EntityKind::Agent, id, json!({"status": "online"}), true)
            .await
            .unwrap();
        assert_eq!(updated["status"], "online");
        assert_eq!(updated["name"], "worker");

        let events = store.db().events_after(-1).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, EventType::Updated);
    }

    #[tokio::test]
    async fn saving_agent_offline_requeues_its_jobs() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let agent_id = agent["id"].as_str().unwrap().to_string();
        let target = create_resource(&store, &agent_id, json!(["t"])).await;
        let job = store
            .insert_prepared(
                EntityKind::Job,
                json!({
                    "id": EntityKind::Job.new_id(),
                    "type": "shell",
                    "target": target["id"],
                    "status": "running",
                    "owner": agent_id,
                }),
            )
            .await
            .unwrap();

        store
            .update(EntityKind::Agent, &agent_id, json!({"status": "offline"}), true)
            .await
            .unwrap();

        let job = store.lookup(EntityKind::Job, job["id"].as_str().unwrap()).await.unwrap();
        assert_eq!(job["status"], "pending");
        assert!(job["owner"].is_null());
    }

    #[tokio::test]
    async fn job_update_cannot_touch_status_or_owner() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let target = create_resource(&store, agent["id"].as_str().unwrap(), json!(["t"])).await;
        let job = store
            .insert_prepared(
                EntityKind::Job,
                json!({
                    "id": EntityKind::Job.new_id(),
                    "type": "shell",
                    "target": target["id"],
                }),
            )
            .await
            .unwrap();

        let updated = store
            .update(
                EntityKind::Job,
                job["id"].as_str().unwrap(),
                json!({"status": "done", "owner": "agt-x", "params": {"k": "v"}}),
                true,
            )
            .await
            .unwrap();
        assert_eq!(updated["status"], "pending");
        assert!(updated["owner"].is_null());
        assert_eq!(updated["params"], json!({"k": "v"}));
    }

    #[tokio::test]
    async fn list_orders_jobs_by_created() {
        let store = entities();
        let agent = create_agent(&store, None).await;
        let target = create_resource(&store, agent["id"].as_str().unwrap(), json!(["t"])).await;

        let mut ids = Vec::new();
        for i in 0..3 {
            let job = store
                .insert_prepared(
                    EntityKind::Job,
                    json!({
                        "id": EntityKind::Job.new_id(),
                        "type": "shell",
                        "target": target["id"],
                        "created": format!("2024-01-0{}T00:00:00Z", 3 - i),
                    }),
                )
                .await
                .unwrap();
            ids.push(job["id"].as_str().unwrap().to_string());
        }

        let listed = store.list(EntityKind::Job, None).await.unwrap();
        let listed_ids: Vec<&str> =
            listed.iter().map(|j| j["id"].as_str().unwrap()).collect();
        assert_eq!(listed_ids, vec![ids[2].as_str(), ids[1].as_str(), ids[0].as_str()]);
    }
}
