//! Local HTTP endpoints for probes and operators.

pub mod health;
pub mod plugins;

use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use custodian_plugin::PluginDir;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::executor::Executor;

#[derive(Clone)]
pub struct AppState {
    pub name: String,
    pub plugins: PluginDir,
    pub executor: Arc<Executor>,
    /// Whether the server currently has us registered.
    pub connected: Arc<AtomicBool>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(name: &str, plugins: PluginDir, max_concurrent: usize) -> Self {
        let executor = Arc::new(Executor::new(Arc::new(plugins.clone()), max_concurrent));
        Self {
            name: name.to_string(),
            plugins,
            executor,
            connected: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/plugins", get(plugins::list))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
