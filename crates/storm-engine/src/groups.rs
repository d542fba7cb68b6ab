use serde_json::Value;
use storm_domain::EntityKind;
use storm_query::{parse, FieldCond, Query};
use storm_store::{EntityStore, StoreError};

/// Evaluate a group's membership: resources matching the query, plus the
/// include overrides, minus the exclude overrides, optionally narrowed by an
/// extra filter in the same dialect.
///
/// A group with an empty query and an empty include list has no members,
/// never the whole resource universe.
pub async fn group_members(
    entities: &EntityStore,
    group: &Value,
    extra_filter: Option<Value>,
) -> Result<Vec<Value>, StoreError> {
    let raw_query = group.get("query").cloned().unwrap_or_else(|| Value::Object(Default::default()));
    let prepared = entities.prepare_user_query(EntityKind::Resource, raw_query).await?;
    let has_query = prepared.as_object().map_or(false, |m| !m.is_empty());

    let include = id_list(group, "include");
    let exclude = id_list(group, "exclude");

    if !has_query && include.is_empty() {
        return Ok(Vec::new());
    }

    let mut query = if has_query { Some(parse(&prepared)?) } else { None };

    if !include.is_empty() {
        let cond = id_in(include);
        query = Some(match query {
            Some(q) => Query::Or(vec![q, cond]),
            None => cond,
        });
    }

    if !exclude.is_empty() {
        let cond = Query::Not(Box::new(id_in(exclude)));
        query = Some(match query {
            Some(q) => q.and(cond),
            None => cond,
        });
    }

    let mut query = query.expect("query or include present");

    if let Some(filter) = extra_filter {
        let prepared = entities.prepare_user_query(EntityKind::Resource, filter).await?;
        query = query.and(parse(&prepared)?);
    }

    entities.find_sorted(EntityKind::Resource, &query).await
}

fn id_list(group: &Value, field: &str) -> Vec<Value> {
    group
        .get(field)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter(|v| v.is_string()).cloned().collect())
        .unwrap_or_default()
}

fn id_in(ids: Vec<Value>) -> Query {
    Query::Field { path: "id".to_string(), cond: FieldCond::In(ids) }
}
