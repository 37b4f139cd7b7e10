use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::webhook;

/// The full route table: the webhook, liveness, and the admin JSON surface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook::handle))
        .route("/healthz", get(handlers::healthz))
        .nest("/api", api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/users",
            post(handlers::onboard_user).get(handlers::list_users),
        )
        .route(
            "/groups",
            post(handlers::create_group).get(handlers::list_groups),
        )
        .route(
            "/groups/{group_id}",
            get(handlers::get_group).delete(handlers::delete_group),
        )
        .route("/groups/{group_id}/members", post(handlers::add_member))
        .route(
            "/groups/{group_id}/retries",
            get(handlers::list_group_retries),
        )
        .route("/members/{member_id}", delete(handlers::remove_member))
        .route("/oauth/exchange", post(handlers::exchange_member_code))
        .route("/notifications", get(handlers::list_notifications))
        .route(
            "/notifications/{notification_id}/dismiss",
            post(handlers::dismiss_notification),
        )
        .route(
            "/notifications/{notification_id}",
            delete(handlers::delete_notification),
        )
        .route("/queue/status", get(handlers::queue_status))
        .route("/telemetry", get(handlers::telemetry))
}
