// src/routes.rs
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::Authenticator;
use crate::broadcast::Broadcaster;
use crate::handlers;
use crate::rate_limit::RateLimiter;
use crate::services::PollService;
use crate::ws;

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PollService>,
    pub authenticator: Arc<dyn Authenticator>,
    pub broadcaster: Arc<Broadcaster>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub fn create_routes(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/polls",
            get(handlers::list_polls).post(handlers::create_poll),
        )
        .route("/polls/my", get(handlers::my_polls))
        .route(
            "/polls/{id}",
            get(handlers::get_poll)
                .patch(handlers::update_poll)
                .delete(handlers::delete_poll),
        )
        .route("/polls/{id}/results", get(handlers::poll_results))
        .route("/polls/{id}/analytics", get(handlers::poll_analytics))
        .route("/polls/{id}/votes", post(handlers::cast_vote))
        .route("/votes/{id}", delete(handlers::retract_vote));

    Router::new()
        .nest("/api/v1", api)
        .route("/cable", get(ws::cable))
        .route("/up", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
