//! Frames exchanged between the server and remote agents over the agent
//! WebSocket. Every frame is a JSON text message `{"type", "payload"}`.

use crate::command::Command;
use crate::errors::Half;
use crate::pipeline::FailureKind;
use serde::{Deserialize, Serialize};

/// Agent to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentEvent {
    #[serde(rename = "agent:register")]
    Register {
        name: String,
        version: String,
        #[serde(default)]
        plugins: Vec<String>,
    },

    #[serde(rename = "task:accepted")]
    Accepted { task_uuid: String },

    #[serde(rename = "task:log")]
    Log { task_uuid: String, line: String },

    #[serde(rename = "task:completed")]
    Completed {
        task_uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<i64>,
    },

    #[serde(rename = "task:failed")]
    Failed {
        task_uuid: String,
        error: String,
        kind: FailureKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        half: Option<Half>,
    },
}

impl AgentEvent {
    /// The task a task-scoped event belongs to.
    pub fn task_uuid(&self) -> Option<&str> {
        match self {
            AgentEvent::Register { .. } => None,
            AgentEvent::Accepted { task_uuid }
            | AgentEvent::Log { task_uuid, .. }
            | AgentEvent::Completed { task_uuid, .. }
            | AgentEvent::Failed { task_uuid, .. } => Some(task_uuid),
        }
    }
}

/// Server to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "agent:register:ok")]
    RegisterOk { name: String },

    #[serde(rename = "agent:register:error")]
    RegisterError { error: String },

    #[serde(rename = "task:run")]
    Run(Command),

    #[serde(rename = "task:cancel")]
    Cancel { task_uuid: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Operation;
    use serde_json::json;

    #[test]
    fn test_failed_frame_shape() {
        let ev = AgentEvent::Failed {
            task_uuid: "t1".into(),
            error: "exit 2".into(),
            kind: FailureKind::Execution,
            half: Some(Half::Target),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "task:failed",
                "payload": {"task_uuid": "t1", "error": "exit 2", "kind": "execution", "half": "target"}
            })
        );
    }

    #[test]
    fn test_run_frame_carries_command() {
        let raw = r#"{"type":"task:run","payload":{"operation":"purge","task_uuid":"t9",
            "store_plugin":"fs","store_endpoint":{"base_dir":"/srv"},"restore_key":"k1"}}"#;
        let ev: ServerEvent = serde_json::from_str(raw).unwrap();
        match ev {
            ServerEvent::Run(cmd) => {
                assert_eq!(cmd.operation, Operation::Purge);
                assert_eq!(cmd.restore_key.as_deref(), Some("k1"));
                assert!(cmd.check().is_ok());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_register_defaults_plugins() {
        let ev: AgentEvent =
            serde_json::from_str(r#"{"type":"agent:register","payload":{"name":"db1","version":"1.0"}}"#).unwrap();
        assert_eq!(
            ev,
            AgentEvent::Register { name: "db1".into(), version: "1.0".into(), plugins: vec![] }
        );
        assert_eq!(ev.task_uuid(), None);
    }
}
