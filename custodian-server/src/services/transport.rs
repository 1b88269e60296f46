//! How a task's command reaches the process that runs it: in this server
//! for the `local` agent, over the agent WebSocket otherwise.

use crate::ws::agent_registry::AgentRegistry;
use async_trait::async_trait;
use custodian_plugin::{run_command, Command, CommandOutput, FailureKind, Half, LogSink, PluginResolver, RunError};
use std::sync::Arc;

pub const LOCAL_AGENT: &str = "local";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The command never started. Safe to retry.
    #[error("agent '{agent}' unreachable: {reason}")]
    Unreachable { agent: String, reason: String },

    #[error("{message}")]
    Execution {
        kind: FailureKind,
        half: Option<Half>,
        message: String,
    },
}

impl From<RunError> for DispatchError {
    fn from(e: RunError) -> Self {
        DispatchError::Execution {
            kind: e.kind(),
            half: e.half(),
            message: e.to_string(),
        }
    }
}

/// Runs a command on a named agent. Dropping the returned future abandons
/// the command and terminates whatever it started.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn execute(&self, agent: &str, cmd: Command, log: LogSink) -> Result<CommandOutput, DispatchError>;
}

/// Executes commands in-process against a plugin resolver.
pub struct LocalAgent {
    resolver: Arc<dyn PluginResolver>,
}

impl LocalAgent {
    pub fn new(resolver: Arc<dyn PluginResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl AgentTransport for LocalAgent {
    async fn execute(&self, _agent: &str, cmd: Command, log: LogSink) -> Result<CommandOutput, DispatchError> {
        Ok(run_command(&cmd, self.resolver.as_ref(), log).await?)
    }
}

/// Sends `local` (or unset) agents to the in-process executor and every
/// other name to the connected remote agent of that name.
pub struct AgentRouter {
    local: LocalAgent,
    remote: Arc<AgentRegistry>,
}

impl AgentRouter {
    pub fn new(local: LocalAgent, remote: Arc<AgentRegistry>) -> Self {
        Self { local, remote }
    }
}

pub fn is_local(agent: &str) -> bool {
    agent.is_empty() || agent == LOCAL_AGENT
}

#[async_trait]
impl AgentTransport for AgentRouter {
    async fn execute(&self, agent: &str, cmd: Command, log: LogSink) -> Result<CommandOutput, DispatchError> {
        if is_local(agent) {
            self.local.execute(agent, cmd, log).await
        } else {
            self.remote.execute(agent, cmd, log).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_plugin::builtin::MemoryStore;
    use custodian_plugin::{discard_log, Endpoint, Operation, PluginRegistry};
    use std::time::Duration;

    fn router() -> AgentRouter {
        let registry = PluginRegistry::new().register("mem", Arc::new(MemoryStore::new()));
        AgentRouter::new(
            LocalAgent::new(Arc::new(registry)),
            Arc::new(AgentRegistry::new(Duration::from_millis(50))),
        )
    }

    #[tokio::test]
    async fn test_local_agent_runs_in_process() {
        let cmd = Command::new(Operation::TestStore, "t1").store("mem", Endpoint::new().set("bucket", "b"));
        let out = router().execute("local", cmd, discard_log()).await.unwrap();
        assert!(out.size.unwrap_or_default() > 0);
    }

    #[tokio::test]
    async fn test_unknown_remote_agent_is_unreachable() {
        let cmd = Command::new(Operation::TestStore, "t1").store("mem", Endpoint::new().set("bucket", "b"));
        let err = router().execute("db-host-7", cmd, discard_log()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable { ref agent, .. } if agent == "db-host-7"));
    }

    #[tokio::test]
    async fn test_validation_failure_names_the_half() {
        let cmd = Command::new(Operation::TestStore, "t1").store("mem", Endpoint::new());
        let err = router().execute("", cmd, discard_log()).await.unwrap_err();
        match err {
            DispatchError::Execution { kind, half, .. } => {
                assert_eq!(kind, FailureKind::Validation);
                assert_eq!(half, Some(Half::Store));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
