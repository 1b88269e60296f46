//! The unit of work a dispatcher hands to an agent.

use crate::endpoint::Endpoint;
use crate::pipeline::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Backup,
    Restore,
    Purge,
    TestStore,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
            Operation::Purge => "purge",
            Operation::TestStore => "test-store",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(Operation::Backup),
            "restore" => Ok(Operation::Restore),
            "purge" => Ok(Operation::Purge),
            "test-store" => Ok(Operation::TestStore),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("missing required '{field}' value for {operation} command")]
pub struct CommandError {
    pub operation: Operation,
    pub field: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub operation: Operation,
    pub task_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_key: Option<String>,
    #[serde(default)]
    pub compression: Compression,
}

impl Command {
    pub fn new(operation: Operation, task_uuid: &str) -> Self {
        Self {
            operation,
            task_uuid: task_uuid.to_string(),
            target_plugin: None,
            target_endpoint: None,
            store_plugin: None,
            store_endpoint: None,
            restore_key: None,
            compression: Compression::None,
        }
    }

    pub fn target(mut self, plugin: &str, endpoint: Endpoint) -> Self {
        self.target_plugin = Some(plugin.to_string());
        self.target_endpoint = Some(endpoint);
        self
    }

    pub fn store(mut self, plugin: &str, endpoint: Endpoint) -> Self {
        self.store_plugin = Some(plugin.to_string());
        self.store_endpoint = Some(endpoint);
        self
    }

    pub fn key(mut self, key: &str) -> Self {
        self.restore_key = Some(key.to_string());
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Checks that every field the operation needs is present and non-empty.
    pub fn check(&self) -> Result<(), CommandError> {
        let missing = |field: &'static str| CommandError {
            operation: self.operation,
            field,
        };
        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());

        let needs_target = matches!(self.operation, Operation::Backup | Operation::Restore);
        if needs_target && !has(&self.target_plugin) {
            return Err(missing("target_plugin"));
        }
        if needs_target && self.target_endpoint.is_none() {
            return Err(missing("target_endpoint"));
        }
        if !has(&self.store_plugin) {
            return Err(missing("store_plugin"));
        }
        if self.store_endpoint.is_none() {
            return Err(missing("store_endpoint"));
        }
        let needs_key = matches!(self.operation, Operation::Restore | Operation::Purge);
        if needs_key && !has(&self.restore_key) {
            return Err(missing("restore_key"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_fields_per_operation() {
        let backup = Command::new(Operation::Backup, "t1").store("fs", Endpoint::new());
        assert_eq!(backup.check().unwrap_err().field, "target_plugin");

        let mut no_store_ep = Command::new(Operation::Backup, "t1")
            .target("pg", Endpoint::new())
            .store("fs", Endpoint::new());
        no_store_ep.store_endpoint = None;
        assert_eq!(no_store_ep.check().unwrap_err().field, "store_endpoint");

        let purge = Command::new(Operation::Purge, "t2").store("fs", Endpoint::new());
        assert_eq!(purge.check().unwrap_err().field, "restore_key");
        assert!(purge.key("k").check().is_ok());

        let test = Command::new(Operation::TestStore, "t3").store("fs", Endpoint::new());
        assert!(test.check().is_ok());
    }

    #[test]
    fn test_wire_format() {
        let cmd = Command::new(Operation::TestStore, "t3").store("fs", Endpoint::new().set("root", "/x"));
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["operation"], "test-store");
        assert_eq!(v["store_endpoint"]["root"], "/x");
        assert!(v.get("target_plugin").is_none());
        let back: Command = serde_json::from_value(v).unwrap();
        assert_eq!(back, cmd);
    }
}
