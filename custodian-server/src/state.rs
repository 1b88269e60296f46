use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::services::engine::{EngineConfig, TaskEngine};
use crate::services::retention::RetentionManager;
use crate::services::scheduler::Scheduler;
use crate::services::transport::{AgentRouter, LocalAgent};
use crate::ws::agent_registry::AgentRegistry;
use custodian_plugin::PluginResolver;
use std::sync::Arc;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub agents: Arc<AgentRegistry>,
    pub engine: Arc<TaskEngine>,
    pub retention: Arc<RetentionManager>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Wires the core together. `resolver` supplies plugins to the `local` agent.
    pub fn new(db: DbPool, config: AppConfig, clock: Arc<dyn Clock>, resolver: Arc<dyn PluginResolver>) -> Self {
        let agents = Arc::new(AgentRegistry::new(config.agent_ack_timeout));
        let transport = Arc::new(AgentRouter::new(LocalAgent::new(resolver), agents.clone()));
        let engine = Arc::new(TaskEngine::new(
            db.clone(),
            clock.clone(),
            transport,
            EngineConfig::from(&config),
        ));
        let retention = Arc::new(RetentionManager::new(db.clone(), clock.clone(), engine.clone()));
        let scheduler = Arc::new(Scheduler::new(db.clone(), clock.clone(), engine.clone()));
        Self {
            db,
            config,
            clock,
            agents,
            engine,
            retention,
            scheduler,
        }
    }
}
