//! Plugin protocol runtime: the capability interface backup backends
//! implement, the subprocess adapter for external plugin executables, and
//! the pipeline that streams data between a target and a store.

pub mod builtin;
pub mod command;
pub mod endpoint;
pub mod errors;
pub mod meta;
pub mod pipe;
pub mod pipeline;
pub mod plugin;
pub mod process;
pub mod run;
pub mod wire;

pub use command::{Command, CommandError, Operation};
pub use endpoint::Endpoint;
pub use errors::{Half, PipelineError, PluginError, ValidationError};
pub use meta::{Features, Field, FieldMode, FieldType, PluginInfo};
pub use pipeline::{run_command, CommandOutput, Compression, FailureKind, RunError};
pub use plugin::{discard_log, LogSink, Plugin, PluginRegistry, PluginResolver, StoredObject};
pub use process::{PluginDir, ProcessPlugin};
pub use run::run;
pub use wire::{AgentEvent, ServerEvent};

/// Wraps a secret so task log viewers can mask it.
pub fn redact(secret: &str) -> String {
    format!("<redacted>{secret}</redacted>")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_redact_wraps_value() {
        assert_eq!(super::redact("hunter2"), "<redacted>hunter2</redacted>");
    }
}
