//! Procedure execution and the job state machine.
//!
//! The claim (`handle_job`) is the one operation in the system that needs a
//! compare-and-swap: it maps to a single conditional update in the store, so
//! two concurrent handlers can never both observe success.

use serde_json::{json, Map, Value};
use storm_domain::{escape_keys, EntityKind, EventType, ValidationErrors};
use storm_query::{parse, Query};
use storm_store::{DocumentStore, EntityStore, StoreError};
use tracing::debug;

use crate::error::EngineError;
use crate::render::TemplateRenderer;

/// Client-supplied overrides for one execution of a procedure.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Target resource, by id or name. Required on the HTTP surface;
    /// subscription dispatch may execute without one.
    pub target: Option<String>,
    pub options: Value,
    pub params: Value,
}

/// What `finish_job` should record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Error,
}

/// Execute a procedure: merge options/params, render the content against the
/// target, and enqueue a pending job. Render failures are recorded on the
/// job itself as `status = error`, not surfaced as HTTP errors.
pub async fn exec_procedure(
    entities: &EntityStore,
    renderer: &dyn TemplateRenderer,
    procedure_id_or_name: &str,
    request: ExecRequest,
) -> Result<Value, EngineError> {
    let procedure = entities.lookup(EntityKind::Procedure, procedure_id_or_name).await?;

    let target = match &request.target {
        Some(value) => Some(entities.lookup(EntityKind::Resource, value).await.map_err(
            |e| match e {
                StoreError::NotFound { .. } | StoreError::AmbiguousLookup { .. } => {
                    StoreError::Validation(ValidationErrors::single(
                        "target",
                        ValidationErrors::not_found(value),
                    ))
                }
                other => other,
            },
        )?),
        None => None,
    };

    let options = merge_maps("options", procedure.get("options"), &request.options)?;
    let params = merge_maps("params", procedure.get("params"), &request.params)?;

    let content = procedure.get("content").and_then(Value::as_str).unwrap_or_default();
    let target_value = target.clone().unwrap_or(Value::Null);
    let rendered = renderer.render(content, &target_value, &params);

    let mut job = json!({
        "id": EntityKind::Job.new_id(),
        "type": procedure["type"],
        "owner": null,
        "target": target.as_ref().map(|t| t["id"].clone()),
        "procedure": procedure["id"],
        "options": options,
        "params": params,
        "status": "pending",
        "result": {},
    });

    match rendered {
        Ok(content) => job["content"] = Value::String(content),
        Err(e) => {
            // The job carries the failure; callers see it through status.
            job["content"] = Value::String(content.to_string());
            job["status"] = Value::String("error".to_string());
            job["result"] = json!({"error": e.to_string()});
        }
    }

    Ok(entities.insert_prepared(EntityKind::Job, job).await?)
}

/// Atomically claim a pending job for an agent.
///
/// The update is one conditional operation: `{id, status: pending} → status
/// = running, owner = agent`. Afterwards the job is reloaded and verified.
/// The scenarios are three:
///
/// 1. the job was not pending, and was left unchanged;
/// 2. the job was pending but another agent claimed it first: it is now
///    running with a different owner;
/// 3. nobody raced us and the update succeeded.
///
/// Only case 3 is a success; the others surface as a conflict.
pub async fn handle_job(
    entities: &EntityStore,
    job_id_or_name: &str,
    owner: &str,
) -> Result<(), EngineError> {
    let job = entities.lookup(EntityKind::Job, job_id_or_name).await?;
    let job_id = id_of(&job)?;

    let agent = entities.lookup(EntityKind::Agent, owner).await.map_err(|e| match e {
        StoreError::NotFound { .. } | StoreError::AmbiguousLookup { .. } => {
            StoreError::Validation(ValidationErrors::single(
                "owner",
                ValidationErrors::not_found(owner),
            ))
        }
        other => other,
    })?;
    let agent_id = id_of(&agent)?;

    let pending = status_guard("pending");
    entities
        .db()
        .update_where(
            EntityKind::Job,
            &job_id,
            &pending,
            &json!({"status": "running", "owner": agent_id}),
        )
        .await?;

    let reloaded = entities.lookup(EntityKind::Job, &job_id).await?;
    if reloaded["status"] != "running" || reloaded["owner"].as_str() != Some(agent_id.as_str()) {
        return Err(EngineError::Conflict("Job is not in 'pending' state".to_string()));
    }

    debug!(job_id = %job_id, owner = %agent_id, "job claimed");
    entities.record_event(EventType::Updated, EntityKind::Job, &reloaded).await?;
    Ok(())
}

/// Finish a running job, storing its result and releasing the owner. The
/// transition is conditional on `status == running`, so a job requeued after
/// its owner died rejects the late completion.
pub async fn finish_job(
    entities: &EntityStore,
    job_id_or_name: &str,
    outcome: JobOutcome,
    result: Value,
) -> Result<(), EngineError> {
    if !result.is_object() {
        return Err(StoreError::Validation(ValidationErrors::single(
            "result",
            "Expected a JSON object.",
        ))
        .into());
    }

    let job = entities.lookup(EntityKind::Job, job_id_or_name).await?;
    let job_id = id_of(&job)?;

    let status = match outcome {
        JobOutcome::Done => "done",
        JobOutcome::Error => "error",
    };

    let running = status_guard("running");
    let updated = entities
        .db()
        .update_where(
            EntityKind::Job,
            &job_id,
            &running,
            // update_where writes the stored form directly, so the free-form
            // result is escaped here.
            &json!({"status": status, "owner": null, "result": escape_keys(result)}),
        )
        .await?;

    match updated {
        Some(_) => {
            let reloaded = entities.lookup(EntityKind::Job, &job_id).await?;
            entities.record_event(EventType::Updated, EntityKind::Job, &reloaded).await?;
            Ok(())
        }
        None => Err(EngineError::Conflict("Job is not in 'running' state".to_string())),
    }
}

fn status_guard(status: &str) -> Query {
    parse(&json!({"status": status})).expect("static guard parses")
}

fn id_of(doc: &Value) -> Result<String, EngineError> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Internal("document has no id".to_string()).into())
}

/// Shallow merge: procedure defaults first, overrides on top.
fn merge_maps(field: &str, defaults: Option<&Value>, overrides: &Value) -> Result<Value, EngineError> {
    let mut merged: Map<String, Value> =
        defaults.and_then(Value::as_object).cloned().unwrap_or_default();

    match overrides {
        Value::Null => {}
        Value::Object(map) => {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
        _ => {
            return Err(StoreError::Validation(ValidationErrors::single(
                field,
                "Expected a JSON object.",
            ))
            .into())
        }
    }

    Ok(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::PlainRenderer;
    use std::sync::Arc;
    use storm_store::MemoryStore;

    async fn seed() -> (EntityStore, String, String, String) {
        let entities = EntityStore::new(Arc::new(MemoryStore::new()));
        let agent = entities
            .create(EntityKind::Agent, json!({"type": "executor", "status": "online"}))
            .await
            .unwrap();
        let agent_id = agent["id"].as_str().unwrap().to_string();
        let resource = entities
            .create(
                EntityKind::Resource,
                json!({"type": "container", "owner": agent_id, "names": ["web-1"]}),
            )
            .await
            .unwrap();
        let resource_id = resource["id"].as_str().unwrap().to_string();
        let procedure = entities
            .create(
                EntityKind::Procedure,
                json!({
                    "type": "shell",
                    "name": "restart",
                    "content": "docker restart {{ target }}",
                    "options": {"timeout": 30},
                    "params": {"signal": "TERM"},
                }),
            )
            .await
            .unwrap();
        let procedure_id = procedure["id"].as_str().unwrap().to_string();
        (entities, agent_id, resource_id, procedure_id)
    }

    async fn exec(entities: &EntityStore, procedure: &str, target: &str) -> Value {
        exec_procedure(
            entities,
            &PlainRenderer,
            procedure,
            ExecRequest { target: Some(target.to_string()), ..Default::default() },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn exec_creates_pending_job_with_merged_params() {
        let (entities, _, resource_id, procedure_id) = seed().await;

        let job = exec_procedure(
            &entities,
            &PlainRenderer,
            &procedure_id,
            ExecRequest {
                target: Some("web-1".to_string()),
                options: json!({"retries": 2}),
                params: json!({"signal": "KILL"}),
            },
        )
        .await
        .unwrap();

        assert!(job["id"].as_str().unwrap().starts_with("job-"));
        assert_eq!(job["status"], "pending");
        assert!(job["owner"].is_null());
        assert_eq!(job["target"], resource_id);
        assert_eq!(job["options"], json!({"timeout": 30, "retries": 2}));
        assert_eq!(job["params"], json!({"signal": "KILL"}));
        assert_eq!(job["content"], "docker restart {{ target }}");
    }

    #[tokio::test]
    async fn exec_with_unknown_target_is_validation_error() {
        let (entities, _, _, procedure_id) = seed().await;
        let err = exec_procedure(
            &entities,
            &PlainRenderer,
            &procedure_id,
            ExecRequest { target: Some("nope".to_string()), ..Default::default() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn handle_claims_exactly_once() {
        let (entities, agent_id, resource_id, procedure_id) = seed().await;
        let job = exec(&entities, &procedure_id, &resource_id).await;
        let job_id = job["id"].as_str().unwrap();

        handle_job(&entities, job_id, &agent_id).await.unwrap();

        let claimed = entities.lookup(EntityKind::Job, job_id).await.unwrap();
        assert_eq!(claimed["status"], "running");
        assert_eq!(claimed["owner"], agent_id.as_str());

        // Second claim conflicts, even from the same agent.
        let err = handle_job(&entities, job_id, &agent_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn concurrent_handles_have_one_winner() {
        let (entities, _, resource_id, procedure_id) = seed().await;
        let job = exec(&entities, &procedure_id, &resource_id).await;
        let job_id = job["id"].as_str().unwrap().to_string();

        let mut agents = Vec::new();
        for i in 0..64 {
            let agent = entities
                .create(EntityKind::Agent, json!({"type": "executor", "name": format!("a{i}")}))
                .await
                .unwrap();
            agents.push(agent["id"].as_str().unwrap().to_string());
        }

        let mut handles = Vec::new();
        for agent_id in agents.clone() {
            let entities = entities.clone();
            let job_id = job_id.clone();
            handles.push(tokio::spawn(async move {
                handle_job(&entities, &job_id, &agent_id).await.is_ok()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let job = entities.lookup(EntityKind::Job, &job_id).await.unwrap();
        assert_eq!(job["status"], "running");
        assert!(agents.contains(&job["owner"].as_str().unwrap().to_string()));
    }

    #[tokio::test]
    async fn complete_requires_running() {
        let (entities, agent_id, resource_id, procedure_id) = seed().await;
        let job = exec(&entities, &procedure_id, &resource_id).await;
        let job_id = job["id"].as_str().unwrap();

        let err = finish_job(&entities, job_id, JobOutcome::Done, json!({"ok": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        handle_job(&entities, job_id, &agent_id).await.unwrap();
        finish_job(&entities, job_id, JobOutcome::Done, json!({"ok": true})).await.unwrap();

        let done = entities.lookup(EntityKind::Job, job_id).await.unwrap();
        assert_eq!(done["status"], "done");
        assert!(done["owner"].is_null());
        assert_eq!(done["result"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn fail_records_error_status() {
        let (entities, agent_id, resource_id, procedure_id) = seed().await;
        let job = exec(&entities, &procedure_id, &resource_id).await;
        let job_id = job["id"].as_str().unwrap();

        handle_job(&entities, job_id, &agent_id).await.unwrap();
        finish_job(&entities, job_id, JobOutcome::Error, json!({"error": "boom"}))
            .await
            .unwrap();

        let failed = entities.lookup(EntityKind::Job, job_id).await.unwrap();
        assert_eq!(failed["status"], "error");
        assert_eq!(failed["result"], json!({"error": "boom"}));
    }

    #[tokio::test]
    async fn late_complete_after_requeue_conflicts() {
        let (entities, agent_id, resource_id, procedure_id) = seed().await;
        let job = exec(&entities, &procedure_id, &resource_id).await;
        let job_id = job["id"].as_str().unwrap();

        handle_job(&entities, job_id, &agent_id).await.unwrap();

        // The owner dies; its jobs go back to pending.
        entities.requeue_jobs_for(&agent_id).await.unwrap();

        let err = finish_job(&entities, job_id, JobOutcome::Done, json!({"ok": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let job = entities.lookup(EntityKind::Job, job_id).await.unwrap();
        assert_eq!(job["status"], "pending");
        assert!(job["owner"].is_null());
    }
}
