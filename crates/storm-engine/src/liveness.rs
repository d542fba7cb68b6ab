//! Agent liveness: heartbeat expiry and the offline sweep.
//!
//! Agents that miss heartbeats for [`HEARTBEAT_TIMEOUT`] are marked offline
//! and their running jobs are requeued. The sweep runs opportunistically
//! from the agent endpoints and from a background task; a mutexed timestamp
//! rate-limits it to once per [`SWEEP_INTERVAL`]. That timestamp is the only
//! process-wide mutable state in the coordinator.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use storm_domain::{EntityKind, EventType};
use storm_query::parse;
use storm_store::{DocumentStore, EntityStore};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::EngineError;

/// How long an agent may stay silent before it is considered offline.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum time between two sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The sweep throttle.
#[derive(Debug, Default)]
pub struct SweepState {
    last_sweep: Mutex<Option<Instant>>,
}

impl SweepState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to sweep. Returns false while the previous sweep is
    /// younger than [`SWEEP_INTERVAL`].
    fn begin(&self) -> bool {
        let mut last = self.last_sweep.lock().expect("sweep lock poisoned");
        if last.map_or(false, |t| t.elapsed() < SWEEP_INTERVAL) {
            return false;
        }
        *last = Some(Instant::now());
        true
    }
}

/// Mark agents with expired heartbeats offline and requeue their jobs.
/// Returns the number of agents transitioned. Rate-limited by `state`; a
/// throttled call is a no-op.
pub async fn sweep_expired_agents(
    entities: &EntityStore,
    state: &SweepState,
) -> Result<usize, EngineError> {
    if !state.begin() {
        return Ok(0);
    }

    let threshold = Utc::now()
        - chrono::Duration::from_std(HEARTBEAT_TIMEOUT).expect("timeout fits chrono range");
    let threshold = threshold.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

    // RFC 3339 UTC timestamps compare chronologically as strings (to within
    // sub-second formatting differences, which a 60 s timeout tolerates).
    let expired_query = parse(&json!({
        "status": "online",
        "heartbeat": {"$lt": threshold},
    }))
    .expect("static query parses");

    let expired = entities.db().find(EntityKind::Agent, &expired_query).await.map_err(EngineError::Store)?;

    let mut transitioned = 0;
    for agent in expired {
        let Some(agent_id) = agent.get("id").and_then(serde_json::Value::as_str) else {
            continue;
        };

        // Guard on the same condition: an agent that heartbeats between the
        // scan and the update stays online.
        let updated = entities
            .db()
            .update_where(EntityKind::Agent, agent_id, &expired_query, &json!({"status": "offline"}))
            .await
            .map_err(EngineError::Store)?;

        if let Some(doc) = updated {
            debug!(agent_id = %agent_id, "agent heartbeat expired, marked offline");
            entities.record_event(EventType::Updated, EntityKind::Agent, &doc).await?;
            entities.requeue_jobs_for(agent_id).await?;
            transitioned += 1;
        }
    }

    Ok(transitioned)
}

/// Background sweeper task. Runs until `shutdown` flips to true; every
/// iteration re-reads state from the store, so restarts are harmless.
pub async fn run_sweeper(
    entities: EntityStore,
    state: std::sync::Arc<SweepState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sweep_expired_agents(&entities, &state).await {
                    warn!(error = %e, "agent sweep failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("sweeper shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storm_store::MemoryStore;

    fn entities() -> EntityStore {
        EntityStore::new(Arc::new(MemoryStore::new()))
    }

    async fn create_agent(store: &EntityStore, heartbeat: &str, status: &str) -> String {
        let agent = store
            .create(
                EntityKind::Agent,
                json!({"type": "t", "status": status, "heartbeat": heartbeat}),
            )
            .await
            .unwrap();
        agent["id"].as_str().unwrap().to_string()
    }

    fn stale() -> String {
        (Utc::now() - chrono::Duration::seconds(120))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }

    fn fresh() -> String {
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }

    #[tokio::test]
    async fn sweep_marks_stale_online_agents_offline() {
        let store = entities();
        let stale_id = create_agent(&store, &stale(), "online").await;
        let fresh_id = create_agent(&store, &fresh(), "online").await;

        let n = sweep_expired_agents(&store, &SweepState::new()).await.unwrap();
        assert_eq!(n, 1);

        let swept = store.lookup(EntityKind::Agent, &stale_id).await.unwrap();
        assert_eq!(swept["status"], "offline");
        let alive = store.lookup(EntityKind::Agent, &fresh_id).await.unwrap();
        assert_eq!(alive["status"], "online");
    }

    #[tokio::test]
    async fn sweep_requeues_jobs_of_expired_agents() {
        let store = entities();
        let agent_id = create_agent(&store, &stale(), "online").await;
        let resource = store
            .create(EntityKind::Resource, json!({"type": "t", "owner": agent_id}))
            .await
            .unwrap();
        let job = store
            .insert_prepared(
                EntityKind::Job,
                json!({
                    "id": EntityKind::Job.new_id(),
                    "type": "shell",
                    "target": resource["id"],
                    "status": "running",
                    "owner": agent_id,
                }),
            )
            .await
            .unwrap();

        sweep_expired_agents(&store, &SweepState::new()).await.unwrap();

        let job = store.lookup(EntityKind::Job, job["id"].as_str().unwrap()).await.unwrap();
        assert_eq!(job["status"], "pending");
        assert!(job["owner"].is_null());
    }

    #[tokio::test]
    async fn sweep_is_rate_limited() {
        let store = entities();
        let state = SweepState::new();

        create_agent(&store, &stale(), "online").await;
        assert_eq!(sweep_expired_agents(&store, &state).await.unwrap(), 1);

        // Another stale agent appears, but the throttle holds.
        create_agent(&store, &stale(), "online").await;
        assert_eq!(sweep_expired_agents(&store, &state).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_agents_are_left_alone() {
        let store = entities();
        let agent_id = create_agent(&store, &stale(), "offline").await;
        let events_before = store.db().last_event_id().await.unwrap();

        let n = sweep_expired_agents(&store, &SweepState::new()).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(store.db().last_event_id().await.unwrap(), events_before);

        let agent = store.lookup(EntityKind::Agent, &agent_id).await.unwrap();
        assert_eq!(agent["status"], "offline");
    }
}
