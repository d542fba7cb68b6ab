//! The event log endpoints: historical paging and the tailable stream.
//!
//! The stream is a chunked JSON-lines response. One blank line goes out
//! immediately so the response headers flush before any event exists; after
//! that, every event past the cursor is one JSON object per line, with a
//! blank keep-alive line whenever nothing happened for [`KEEP_ALIVE_TIME`].
//! The server never closes the stream; only the client disconnecting ends
//! it, which the next write detects within one keep-alive period.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use storm_store::DocumentStore;
use tokio::sync::watch;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Number of events returned when `count` is not given.
const DEFAULT_COUNT: i64 = 128;

/// A blank line is sent if the stream was silent this long.
const KEEP_ALIVE_TIME: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    pub stream: Option<String>,
    pub start: Option<i64>,
    pub count: Option<i64>,
}

impl EventsParams {
    fn streaming(&self) -> bool {
        self.stream.as_deref().map_or(false, |s| !matches!(s, "" | "0" | "false"))
    }
}

pub async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Result<Response, ApiError> {
    if params.streaming() {
        streaming_response(state, params.start).await
    } else {
        static_response(state, params.start, params.count).await
    }
}

/// The slice `[start, start + count)`, or the last `count` events when
/// `start` is omitted.
async fn static_response(
    state: AppState,
    start: Option<i64>,
    count: Option<i64>,
) -> Result<Response, ApiError> {
    let count = count.unwrap_or(DEFAULT_COUNT);
    let db = state.entities.db();

    let events = match start {
        Some(start) => db.events_slice(start, count).await?,
        None => db.events_tail(count).await?,
    };

    let body: Vec<Value> = events
        .iter()
        .map(|ev| serde_json::to_value(ev).unwrap_or(Value::Null))
        .collect();
    Ok(Json(Value::Array(body)).into_response())
}

struct StreamState {
    db: Arc<dyn DocumentStore>,
    events_rx: watch::Receiver<i64>,
    last_seen: i64,
    buffered: VecDeque<String>,
    header_sent: bool,
}

async fn streaming_response(state: AppState, start: Option<i64>) -> Result<Response, ApiError> {
    let db = state.entities.db().clone();
    let last_seen = match start {
        Some(start) => start - 1,
        None => db.last_event_id().await?,
    };

    let stream_state = StreamState {
        events_rx: db.watch_events(),
        db,
        last_seen,
        buffered: VecDeque::new(),
        header_sent: false,
    };

    let stream = futures::stream::unfold(stream_state, |mut st| async move {
        loop {
            if !st.header_sent {
                // Flush the response headers before anything happens, so a
                // client on an idle log does not hang waiting for them.
                st.header_sent = true;
                return Some((Ok::<String, Infallible>("\n".to_string()), st));
            }

            if let Some(line) = st.buffered.pop_front() {
                return Some((Ok(line), st));
            }

            match st.db.events_after(st.last_seen).await {
                Ok(events) if !events.is_empty() => {
                    for event in events {
                        st.last_seen = event.id;
                        if let Ok(line) = serde_json::to_string(&event) {
                            st.buffered.push_back(line + "\n");
                        }
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    // Cursor death: log and reopen on the next pass.
                    warn!(error = %e, "event stream read failed");
                }
            }

            match tokio::time::timeout(KEEP_ALIVE_TIME, st.events_rx.changed()).await {
                // Something was appended; drain it on the next pass.
                Ok(Ok(())) => continue,
                // The store is gone; end the stream cleanly.
                Ok(Err(_)) => return None,
                // Idle: keep the connection alive.
                Err(_) => return Some((Ok("\n".to_string()), st)),
            }
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(e.to_string()))
}
