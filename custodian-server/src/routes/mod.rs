pub mod agents;
pub mod archives;
pub mod jobs;
pub mod schedules;
pub mod stores;
pub mod tasks;

use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .merge(jobs::router())
        .merge(tasks::router())
        .merge(archives::router())
        .merge(schedules::router())
        .merge(stores::router())
        .merge(agents::router())
        .route("/agent/ws", get(crate::ws::agent_registry::ws_handler));

    Router::new()
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Query flags such as `?debug` or `?unused=true`: present and not falsy.
pub(crate) fn flag(value: &Option<String>) -> bool {
    match value.as_deref() {
        None => false,
        Some(v) => !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "n"),
    }
}
