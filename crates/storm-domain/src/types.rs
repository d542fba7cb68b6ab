use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::StormId;

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

// ── Agent ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    #[default]
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A process running near real infrastructure. Agents discover resources,
/// publish snapshots of them, and claim jobs. Liveness is tracked through
/// `heartbeat`; agents that miss heartbeats for 60 seconds are swept offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: StormId,
    pub r#type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default = "now")]
    pub heartbeat: DateTime<Utc>,
    #[serde(default = "empty_object")]
    pub options: Value,
}

// ── Resource ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Unknown,
    Creating,
    Created,
    Starting,
    Running,
    Updating,
    Updated,
    Stopping,
    Stopped,
    Removing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// A representation of a real-world object (service, node, container) owned
/// by exactly one agent. Resources may be addressed by id or by any element
/// of `names`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: StormId,
    pub r#type: String,
    #[serde(default)]
    pub names: Vec<String>,
    pub owner: StormId,
    #[serde(default)]
    pub parent: Option<StormId>,
    #[serde(default)]
    pub cluster: Option<StormId>,
    #[serde(default)]
    pub host: Option<StormId>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default)]
    pub health: ResourceHealth,
    #[serde(default = "empty_object")]
    pub snapshot: Value,
}

// ── Group ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A named port a group of resources provides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
}

/// A dynamic set of resources: everything matching `query`, plus `include`,
/// minus `exclude`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: StormId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default = "empty_object")]
    pub query: Value,
    #[serde(default)]
    pub include: Vec<StormId>,
    #[serde(default)]
    pub exclude: Vec<StormId>,
}

// ── Application ───────────────────────────────────────────────────────────────

/// A pointer to a named service inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    pub group: StormId,
    pub service_name: String,
}

/// A typed edge between two components of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentLink {
    pub from_component: StormId,
    pub to_service: ServiceReference,
}

/// A named composition of groups. Every link endpoint must be one of
/// `components`, and the referenced service must exist in its group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: StormId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub components: Vec<StormId>,
    #[serde(default)]
    pub links: Vec<ComponentLink>,
    #[serde(default)]
    pub expose: Vec<ServiceReference>,
}

// ── Procedure ─────────────────────────────────────────────────────────────────

/// A templated unit of work. `content` is opaque to the coordinator; it is
/// handed to the template collaborator at exec time. `options` and `params`
/// are defaults merged with per-exec overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    pub id: StormId,
    pub r#type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "empty_object")]
    pub options: Value,
    #[serde(default = "empty_object")]
    pub params: Value,
}

// ── Job ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Done,
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A single invocation of a procedure against a target resource.
///
/// Invariant: `status == running` exactly when `owner` is set. The only legal
/// mutations of `status`/`owner` are the handle/complete/fail transitions and
/// the requeue performed when an owner dies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: StormId,
    pub r#type: String,
    #[serde(default)]
    pub owner: Option<StormId>,
    #[serde(default)]
    pub target: Option<StormId>,
    #[serde(default)]
    pub procedure: Option<StormId>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "empty_object")]
    pub options: Value,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default = "empty_object")]
    pub result: Value,
    #[serde(default = "now")]
    pub created: DateTime<Utc>,
}

// ── Subscription ──────────────────────────────────────────────────────────────

/// A standing rule: whenever an event concerns a current member of `group`,
/// execute `procedure` against `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: StormId,
    pub group: StormId,
    pub procedure: StormId,
    #[serde(default)]
    pub target: Option<StormId>,
    #[serde(default = "empty_object")]
    pub options: Value,
    #[serde(default = "empty_object")]
    pub params: Value,
}

// ── Event ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// An append-only record of a create/update/delete, indexed by a monotonic
/// integer id. Ids are allocated by an atomic counter and never reused, even
/// after the capped log evicts old entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    #[serde(default = "now")]
    pub date: DateTime<Utc>,
    pub event_type: EventType,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub entity_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_defaults() {
        let agent: Agent =
            serde_json::from_value(json!({"id": "agt-x", "type": "test"})).unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(agent.options.as_object().unwrap().is_empty());
        assert!(agent.name.is_none());
    }

    #[test]
    fn resource_defaults() {
        let res: Resource = serde_json::from_value(
            json!({"id": "res-x", "type": "container", "owner": "agt-x"}),
        )
        .unwrap();
        assert_eq!(res.status, ResourceStatus::Unknown);
        assert_eq!(res.health, ResourceHealth::Unknown);
        assert!(res.names.is_empty());
        assert!(res.parent.is_none());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(JobStatus::Pending).unwrap(), json!("pending"));
        assert_eq!(serde_json::to_value(AgentStatus::Online).unwrap(), json!("online"));
        assert_eq!(
            serde_json::to_value(ResourceStatus::Running).unwrap(),
            json!("running")
        );
    }

    #[test]
    fn bad_choice_is_rejected() {
        let res = serde_json::from_value::<Agent>(
            json!({"id": "agt-x", "type": "t", "status": "sleeping"}),
        );
        assert!(res.is_err());
    }

    #[test]
    fn job_invariant_fields_roundtrip() {
        let job: Job = serde_json::from_value(json!({
            "id": "job-x",
            "type": "shell",
            "target": "res-x",
            "status": "running",
            "owner": "agt-x",
        }))
        .unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.owner.as_ref().unwrap().as_str(), "agt-x");
        assert_eq!(job.target.as_ref().unwrap().as_str(), "res-x");
    }
}
