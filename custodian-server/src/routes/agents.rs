use crate::state::AppState;
use crate::ws::agent_registry::AgentInfo;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/agents", get(list_agents))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentInfo>> {
    Json(state.agents.connected())
}
