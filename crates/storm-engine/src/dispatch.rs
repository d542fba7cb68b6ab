//! Subscription dispatch.
//!
//! A background task tails the event log. For every event, subscriptions are
//! grouped by their group; when the entity the event concerns is currently a
//! member of that group, each subscription's procedure is executed against
//! its stored target with its stored options/params plus a synthesized
//! `event` param. Dangling subscriptions are skipped, and dispatch errors
//! are logged and swallowed, never surfaced to the mutation that caused the
//! event.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use storm_domain::{EntityKind, Event};
use storm_store::{DocumentStore, EntityStore};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::groups::group_members;
use crate::jobs::{exec_procedure, ExecRequest};
use crate::render::TemplateRenderer;

/// Dispatch a single event. Returns the number of jobs enqueued.
pub async fn dispatch_event(
    entities: &EntityStore,
    renderer: &dyn TemplateRenderer,
    event: &Event,
) -> Result<usize, EngineError> {
    let subscriptions = entities.list(EntityKind::Subscription, None).await?;
    if subscriptions.is_empty() {
        return Ok(0);
    }

    let mut by_group: HashMap<String, Vec<Value>> = HashMap::new();
    for sub in subscriptions {
        let Some(group_id) = sub.get("group").and_then(Value::as_str) else { continue };
        by_group.entry(group_id.to_string()).or_default().push(sub);
    }

    let mut enqueued = 0;

    for (group_id, subs) in by_group {
        // Dangling group reference: skip silently.
        let Ok(group) = entities.lookup(EntityKind::Group, &group_id).await else { continue };

        let members = group_members(entities, &group, None).await?;
        let concerned = members
            .iter()
            .any(|m| m.get("id").and_then(Value::as_str) == Some(event.entity_id.as_str()));
        if !concerned {
            continue;
        }

        for sub in subs {
            let Some(procedure_id) = sub.get("procedure").and_then(Value::as_str) else {
                continue;
            };
            // Dangling procedure reference: skip silently.
            if entities.lookup(EntityKind::Procedure, procedure_id).await.is_err() {
                continue;
            }

            let mut params = sub.get("params").cloned().unwrap_or_else(|| json!({}));
            if params.get("event").is_none() {
                params["event"] = json!({
                    "id": event.id,
                    "date": event.date,
                    "event_type": event.event_type,
                    "entity_type": event.entity_type,
                    "entity_id": event.entity_id,
                    "entity_names": event.entity_names,
                });
            }

            let request = ExecRequest {
                target: sub.get("target").and_then(Value::as_str).map(str::to_string),
                options: sub.get("options").cloned().unwrap_or_else(|| json!({})),
                params,
            };

            match exec_procedure(entities, renderer, procedure_id, request).await {
                Ok(job) => {
                    debug!(
                        subscription = %sub.get("id").and_then(serde_json::Value::as_str).unwrap_or(""),
                        job = %job.get("id").and_then(serde_json::Value::as_str).unwrap_or(""),
                        "subscription fired"
                    );
                    enqueued += 1;
                }
                Err(e) => {
                    warn!(
                        subscription = %sub.get("id").and_then(serde_json::Value::as_str).unwrap_or(""),
                        error = %e,
                        "subscription dispatch failed"
                    );
                }
            }
        }
    }

    Ok(enqueued)
}

/// Background dispatcher task: tails the event log from its position at
/// startup, re-reading everything from the store every iteration so
/// arbitrary restarts are tolerated.
pub async fn run_dispatcher(
    entities: EntityStore,
    renderer: Arc<dyn TemplateRenderer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_seen = entities.db().last_event_id().await.unwrap_or(-1);
    let mut events_rx = entities.db().watch_events();

    loop {
        // Drain everything past our cursor before waiting again.
        loop {
            let events = match entities.db().events_after(last_seen).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "dispatcher failed to read events");
                    break;
                }
            };
            if events.is_empty() {
                break;
            }
            for event in events {
                last_seen = event.id;
                if let Err(e) = dispatch_event(&entities, renderer.as_ref(), &event).await {
                    warn!(event_id = event.id, error = %e, "event dispatch failed");
                }
            }
        }

        tokio::select! {
            changed = events_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("dispatcher shutting down");
                    return;
                }
            }
        }
    }
}
