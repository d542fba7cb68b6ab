//! Type-aware validation and normalization of incoming entity documents.
//!
//! Validation runs on the raw JSON body after merging with the stored
//! document (for updates). Reference fields are resolved to ids here, so the
//! stored form never contains names. Errors accumulate per field and surface
//! as a 400 with a `{field: [messages]}` body.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use storm_domain::{
    AgentStatus, EntityKind, JobStatus, Protocol, ResourceHealth, ResourceStatus, ValidationErrors,
};

use crate::entities::EntityStore;
use crate::error::StoreError;

/// Fields dropped from client bodies at creation time.
pub(crate) fn read_only_on_create(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        // Jobs are born pending and unowned regardless of what the caller sent.
        EntityKind::Job => &["id", "status", "owner", "created", "result"],
        _ => &["id"],
    }
}

/// Fields dropped from client bodies on update. `status`/`owner` on jobs only
/// move through the handle/complete/fail transitions and the requeue path.
pub(crate) fn read_only_on_update(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Job => &["id", "status", "owner", "created", "type", "target", "procedure"],
        EntityKind::Subscription => &["id", "group", "procedure"],
        _ => &["id"],
    }
}

pub(crate) async fn validate(
    entities: &EntityStore,
    kind: EntityKind,
    doc: &mut Map<String, Value>,
    self_id: &str,
) -> Result<(), StoreError> {
    let mut errors = ValidationErrors::new();

    match kind {
        EntityKind::Agent => validate_agent(entities, doc, self_id, &mut errors).await?,
        EntityKind::Resource => validate_resource(entities, doc, &mut errors).await?,
        EntityKind::Group => validate_group(entities, doc, self_id, &mut errors).await?,
        EntityKind::Application => validate_application(entities, doc, self_id, &mut errors).await?,
        EntityKind::Procedure => validate_procedure(entities, doc, self_id, &mut errors).await?,
        EntityKind::Job => validate_job(doc, &mut errors),
        EntityKind::Subscription => validate_subscription(entities, doc, &mut errors).await?,
    }

    errors.into_result().map_err(StoreError::Validation)
}

async fn validate_agent(
    entities: &EntityStore,
    doc: &mut Map<String, Value>,
    self_id: &str,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    require_string(doc, "type", errors);
    optional_string(doc, "name", errors);
    check_choice::<AgentStatus>(doc, "status", errors);
    check_object(doc, "options", errors);
    check_unique_name(entities, EntityKind::Agent, doc, self_id, errors).await?;
    Ok(())
}

async fn validate_resource(
    entities: &EntityStore,
    doc: &mut Map<String, Value>,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    require_string(doc, "type", errors);

    if let Some(names) = doc.get("names") {
        match names.as_array() {
            Some(items) => {
                if items.iter().any(|v| !v.as_str().map_or(false, |s| !s.is_empty())) {
                    errors.add("names", "Names must be non-empty strings.");
                }
            }
            None => errors.add("names", ValidationErrors::wrong_type("a list of strings")),
        }
    }

    resolve_reference(entities, doc, "owner", EntityKind::Agent, true, errors).await?;
    for field in ["parent", "cluster", "host"] {
        resolve_reference(entities, doc, field, EntityKind::Resource, false, errors).await?;
    }

    optional_string(doc, "image", errors);
    check_choice::<ResourceStatus>(doc, "status", errors);
    check_choice::<ResourceHealth>(doc, "health", errors);
    check_object(doc, "snapshot", errors);
    Ok(())
}

async fn validate_group(
    entities: &EntityStore,
    doc: &mut Map<String, Value>,
    self_id: &str,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    optional_string(doc, "name", errors);
    check_object(doc, "query", errors);

    if let Some(services) = doc.get("services") {
        match services.as_array() {
            Some(items) => {
                let mut seen = Vec::new();
                for item in items {
                    let Some(service) = item.as_object() else {
                        errors.add("services", ValidationErrors::wrong_type("a list of services"));
                        continue;
                    };
                    match service.get("name").and_then(Value::as_str) {
                        Some(name) if !name.is_empty() => {
                            if seen.contains(&name) {
                                errors.add(
                                    "services",
                                    format!("Duplicate service name \"{}\".", name),
                                );
                            }
                            seen.push(name);
                        }
                        _ => errors.add("services", "Service names are required."),
                    }
                    if let Some(protocol) = service.get("protocol") {
                        if serde_json::from_value::<Protocol>(protocol.clone()).is_err() {
                            errors.add(
                                "services",
                                ValidationErrors::bad_choice(&text(protocol)),
                            );
                        }
                    } else {
                        errors.add("services", "Service protocol is required.");
                    }
                    if !service.get("port").map_or(false, Value::is_u64) {
                        errors.add("services", "Service port must be a positive integer.");
                    }
                }
            }
            None => errors.add("services", ValidationErrors::wrong_type("a list of services")),
        }
    }

    resolve_reference_list(entities, doc, "include", EntityKind::Resource, errors).await?;
    resolve_reference_list(entities, doc, "exclude", EntityKind::Resource, errors).await?;
    check_unique_name(entities, EntityKind::Group, doc, self_id, errors).await?;
    Ok(())
}

async fn validate_application(
    entities: &EntityStore,
    doc: &mut Map<String, Value>,
    self_id: &str,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    optional_string(doc, "name", errors);
    resolve_reference_list(entities, doc, "components", EntityKind::Group, errors).await?;

    // Load the component groups once; links and exposed services must point
    // inside this set.
    let component_ids: Vec<String> = doc
        .get("components")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let mut components = Vec::new();
    for id in &component_ids {
        if let Ok(group) = entities.lookup(EntityKind::Group, id).await {
            components.push(group);
        }
    }

    let service_exists = |group_id: &str, service: &str| {
        components
            .iter()
            .filter(|g| g["id"].as_str() == Some(group_id))
            .any(|g| {
                g["services"]
                    .as_array()
                    .map_or(false, |ss| ss.iter().any(|s| s["name"].as_str() == Some(service)))
            })
    };

    if let Some(links) = doc.get_mut("links") {
        match links.as_array_mut() {
            Some(items) => {
                for link in items {
                    if let Err(message) =
                        resolve_link(entities, link, &component_ids, &service_exists).await
                    {
                        errors.add("links", message);
                    }
                }
            }
            None => errors.add("links", ValidationErrors::wrong_type("a list of links")),
        }
    }

    if let Some(expose) = doc.get_mut("expose") {
        match expose.as_array_mut() {
            Some(items) => {
                for item in items {
                    match resolve_service_ref(entities, item, &component_ids, &service_exists).await
                    {
                        Ok(()) => {}
                        Err(message) => errors.add("expose", message),
                    }
                }
            }
            None => errors.add("expose", ValidationErrors::wrong_type("a list of services")),
        }
    }

    check_unique_name(entities, EntityKind::Application, doc, self_id, errors).await?;
    Ok(())
}

/// Resolve one link in place, rewriting its group references to ids.
async fn resolve_link(
    entities: &EntityStore,
    link: &mut Value,
    component_ids: &[String],
    service_exists: &impl Fn(&str, &str) -> bool,
) -> Result<(), String> {
    if !link.is_object() {
        return Err("Expected a link object.".to_string());
    }

    let from = link
        .get("from_component")
        .and_then(Value::as_str)
        .ok_or_else(|| "Links require a from_component.".to_string())?
        .to_string();
    let from_id = entities
        .try_resolve_id(EntityKind::Group, &from)
        .await
        .filter(|id| component_ids.contains(id))
        .ok_or_else(|| format!("Component {} is not part of the application", from))?;
    link["from_component"] = Value::String(from_id);

    let to_service = link
        .get_mut("to_service")
        .ok_or_else(|| "Links require a to_service.".to_string())?;
    resolve_service_ref_inner(entities, to_service, component_ids, service_exists).await
}

async fn resolve_service_ref(
    entities: &EntityStore,
    item: &mut Value,
    component_ids: &[String],
    service_exists: &impl Fn(&str, &str) -> bool,
) -> Result<(), String> {
    if !item.is_object() {
        return Err("Expected a service reference.".to_string());
    }
    resolve_service_ref_inner(entities, item, component_ids, service_exists).await
}

async fn resolve_service_ref_inner(
    entities: &EntityStore,
    sref: &mut Value,
    component_ids: &[String],
    service_exists: &impl Fn(&str, &str) -> bool,
) -> Result<(), String> {
    let group = sref
        .get("group")
        .and_then(Value::as_str)
        .ok_or_else(|| "Service references require a group.".to_string())?
        .to_string();
    let service = sref
        .get("service_name")
        .and_then(Value::as_str)
        .ok_or_else(|| "Service references require a service_name.".to_string())?
        .to_string();

    let group_id = entities
        .try_resolve_id(EntityKind::Group, &group)
        .await
        .filter(|id| component_ids.contains(id))
        .ok_or_else(|| format!("Component {} is not part of the application", group))?;

    if !service_exists(&group_id, &service) {
        return Err(format!("Service {} is not part of component {}", service, group));
    }

    sref["group"] = Value::String(group_id);
    Ok(())
}

async fn validate_procedure(
    entities: &EntityStore,
    doc: &mut Map<String, Value>,
    self_id: &str,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    require_string(doc, "type", errors);
    optional_string(doc, "name", errors);
    if let Some(content) = doc.get("content") {
        if !content.is_string() {
            errors.add("content", ValidationErrors::wrong_type("a string"));
        }
    }
    check_object(doc, "options", errors);
    check_object(doc, "params", errors);
    check_unique_name(entities, EntityKind::Procedure, doc, self_id, errors).await?;
    Ok(())
}

/// Jobs are created internally by procedure exec; clients may only touch the
/// free-form fields, and even those shallowly.
fn validate_job(doc: &mut Map<String, Value>, errors: &mut ValidationErrors) {
    check_choice::<JobStatus>(doc, "status", errors);
    check_object(doc, "options", errors);
    check_object(doc, "params", errors);
    check_object(doc, "result", errors);
    if let Some(content) = doc.get("content") {
        if !content.is_string() {
            errors.add("content", ValidationErrors::wrong_type("a string"));
        }
    }
}

async fn validate_subscription(
    entities: &EntityStore,
    doc: &mut Map<String, Value>,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    resolve_reference(entities, doc, "group", EntityKind::Group, true, errors).await?;
    resolve_reference(entities, doc, "procedure", EntityKind::Procedure, true, errors).await?;
    resolve_reference(entities, doc, "target", EntityKind::Resource, false, errors).await?;
    check_object(doc, "options", errors);
    check_object(doc, "params", errors);
    Ok(())
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn require_string(doc: &Map<String, Value>, field: &str, errors: &mut ValidationErrors) {
    match doc.get(field) {
        None | Some(Value::Null) => errors.add(field, ValidationErrors::required()),
        Some(Value::String(s)) if s.is_empty() => errors.add(field, ValidationErrors::blank()),
        Some(Value::String(_)) => {}
        Some(_) => errors.add(field, ValidationErrors::wrong_type("a string")),
    }
}

fn optional_string(doc: &Map<String, Value>, field: &str, errors: &mut ValidationErrors) {
    match doc.get(field) {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if s.is_empty() => errors.add(field, ValidationErrors::blank()),
        Some(Value::String(_)) => {}
        Some(_) => errors.add(field, ValidationErrors::wrong_type("a string")),
    }
}

fn check_choice<T: DeserializeOwned>(
    doc: &Map<String, Value>,
    field: &str,
    errors: &mut ValidationErrors,
) {
    if let Some(value) = doc.get(field) {
        if value.is_null() {
            return;
        }
        if serde_json::from_value::<T>(value.clone()).is_err() {
            errors.add(field, ValidationErrors::bad_choice(&text(value)));
        }
    }
}

fn check_object(doc: &Map<String, Value>, field: &str, errors: &mut ValidationErrors) {
    if let Some(value) = doc.get(field) {
        if !value.is_null() && !value.is_object() {
            errors.add(field, "Expected a JSON object.");
        }
    }
}

/// Resolve a reference-valued field in place: the stored form is always an
/// id. Unknown values are a validation error; the caller decides nothing
/// silently here, unlike query-side resolution.
async fn resolve_reference(
    entities: &EntityStore,
    doc: &mut Map<String, Value>,
    field: &str,
    target: EntityKind,
    required: bool,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    match doc.get(field) {
        None | Some(Value::Null) => {
            if required {
                errors.add(field, ValidationErrors::required());
            }
        }
        Some(Value::String(value)) => {
            let value = value.clone();
            match entities.try_resolve_id(target, &value).await {
                Some(id) => {
                    doc.insert(field.to_string(), Value::String(id));
                }
                None => errors.add(field, ValidationErrors::not_found(&value)),
            }
        }
        Some(_) => errors.add(field, ValidationErrors::wrong_type("an id or name")),
    }
    Ok(())
}

async fn resolve_reference_list(
    entities: &EntityStore,
    doc: &mut Map<String, Value>,
    field: &str,
    target: EntityKind,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    let Some(value) = doc.get(field) else { return Ok(()) };
    let Some(items) = value.as_array().cloned() else {
        errors.add(field, ValidationErrors::wrong_type("a list of ids or names"));
        return Ok(());
    };

    let mut resolved = Vec::with_capacity(items.len());
    for item in items {
        let Some(value) = item.as_str() else {
            errors.add(field, ValidationErrors::wrong_type("a list of ids or names"));
            continue;
        };
        match entities.try_resolve_id(target, value).await {
            Some(id) => resolved.push(Value::String(id)),
            None => errors.add(field, ValidationErrors::not_found(value)),
        }
    }
    doc.insert(field.to_string(), Value::Array(resolved));
    Ok(())
}

async fn check_unique_name(
    entities: &EntityStore,
    kind: EntityKind,
    doc: &Map<String, Value>,
    self_id: &str,
    errors: &mut ValidationErrors,
) -> Result<(), StoreError> {
    let Some(name) = doc.get("name").and_then(Value::as_str) else { return Ok(()) };
    if name.is_empty() {
        return Ok(());
    }
    if entities.name_taken(kind, name, self_id).await? {
        errors.add("name", "This field must be unique.");
    }
    Ok(())
}
