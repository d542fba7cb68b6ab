use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{agents, apps, events, groups, jobs, procedures, resources, subscriptions};
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        // Agents
        .route("/v1/agents", get(agents::list).post(agents::create))
        .route(
            "/v1/agents/:id",
            get(agents::get)
                .put(agents::update)
                .patch(agents::patch)
                .delete(agents::delete),
        )
        .route("/v1/agents/:id/heartbeat", post(agents::heartbeat))
        // Resources
        .route("/v1/resources", get(resources::list).post(resources::create))
        .route(
            "/v1/resources/:id",
            get(resources::get)
                .put(resources::update)
                .patch(resources::patch)
                .delete(resources::delete),
        )
        // Groups
        .route("/v1/groups", get(groups::list).post(groups::create))
        .route(
            "/v1/groups/:id",
            get(groups::get)
                .put(groups::update)
                .patch(groups::patch)
                .delete(groups::delete),
        )
        .route("/v1/groups/:id/members", get(groups::members).post(groups::add_members))
        // Applications
        .route("/v1/apps", get(apps::list).post(apps::create))
        .route(
            "/v1/apps/:id",
            get(apps::get).put(apps::update).patch(apps::patch).delete(apps::delete),
        )
        // Procedures
        .route("/v1/procedures", get(procedures::list).post(procedures::create))
        .route(
            "/v1/procedures/:id",
            get(procedures::get)
                .put(procedures::update)
                .patch(procedures::patch)
                .delete(procedures::delete),
        )
        .route("/v1/procedures/:id/exec", post(procedures::exec))
        .route("/v1/procedures/:id/attach", post(procedures::attach))
        // Jobs
        .route("/v1/jobs", get(jobs::list))
        .route(
            "/v1/jobs/:id",
            get(jobs::get).put(jobs::update).patch(jobs::patch).delete(jobs::delete),
        )
        .route("/v1/jobs/:id/handle", post(jobs::handle))
        .route("/v1/jobs/:id/complete", post(jobs::complete))
        .route("/v1/jobs/:id/fail", post(jobs::fail))
        // Subscriptions
        .route("/v1/subscriptions", get(subscriptions::list))
        .route("/v1/subscriptions/:id", get(subscriptions::get).delete(subscriptions::delete))
        // Events
        .route("/v1/events", get(events::events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
