//! Error types and exit codes shared by plugins and the runtime that drives them.

use thiserror::Error;

pub const SUCCESS: i32 = 0;
pub const USAGE: i32 = 1;
pub const PLUGIN_FAILURE: i32 = 2;
pub const UNSUPPORTED_ACTION: i32 = 10;
pub const ENDPOINT_MISSING_KEY: i32 = 11;
pub const ENDPOINT_BAD_DATA: i32 = 12;
pub const EXEC_FAILURE: i32 = 13;
pub const JSON_FAILURE: i32 = 14;
pub const RESTORE_KEY_REQUIRED: i32 = 15;

/// A single field constraint that an endpoint failed to satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub problem: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' {problem}")]
    BadData { field: String, problem: String },

    #[error("endpoint configuration is not a JSON object")]
    NotAnObject,

    #[error("{}", join_violations(.0))]
    Multiple(Vec<FieldViolation>),
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("field '{}' {}", v.field, v.problem))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    fn exit_code(&self) -> i32 {
        match self {
            ValidationError::MissingField(_) => ENDPOINT_MISSING_KEY,
            ValidationError::Multiple(v) if v.iter().all(|f| f.problem == "is required") => {
                ENDPOINT_MISSING_KEY
            }
            _ => ENDPOINT_BAD_DATA,
        }
    }
}

#[derive(Error, Debug)]
pub enum PluginError {
    /// The backend does not offer this operation at all.
    #[error("operation '{0}' is not implemented by this plugin")]
    Unimplemented(String),

    #[error("invalid endpoint: {0}")]
    Validation(#[from] ValidationError),

    #[error("a restore key is required for this operation")]
    MissingKey,

    /// The plugin tried and failed. `stderr_tail` carries the last lines it printed.
    #[error("{message}{}", tail_suffix(.stderr_tail))]
    Failed {
        message: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn tail_suffix(tail: &str) -> String {
    if tail.trim().is_empty() {
        String::new()
    } else {
        format!("\n--- stderr ---\n{}", tail.trim_end())
    }
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        PluginError::Failed {
            message: message.into(),
            exit_code: None,
            stderr_tail: String::new(),
        }
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, PluginError::Unimplemented(_))
    }

    /// Exit status a standalone plugin process reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PluginError::Unimplemented(_) => UNSUPPORTED_ACTION,
            PluginError::Validation(v) => v.exit_code(),
            PluginError::MissingKey => RESTORE_KEY_REQUIRED,
            PluginError::Failed { exit_code: Some(code), .. } if *code != SUCCESS => *code,
            PluginError::Failed { .. } => PLUGIN_FAILURE,
            PluginError::Io(_) => EXEC_FAILURE,
            PluginError::Json(_) => JSON_FAILURE,
        }
    }

    /// Inverse of [`PluginError::exit_code`], used when a subprocess plugin exits nonzero.
    pub fn from_exit(op: &str, code: Option<i32>, stderr_tail: String) -> Self {
        match code {
            Some(UNSUPPORTED_ACTION) => PluginError::Unimplemented(op.to_string()),
            Some(RESTORE_KEY_REQUIRED) => PluginError::MissingKey,
            Some(ENDPOINT_MISSING_KEY) | Some(ENDPOINT_BAD_DATA) => {
                PluginError::Validation(ValidationError::BadData {
                    field: "endpoint".into(),
                    problem: last_line(&stderr_tail).unwrap_or("was rejected by the plugin").into(),
                })
            }
            Some(c) => PluginError::Failed {
                message: format!("{op} exited with status {c}"),
                exit_code: Some(c),
                stderr_tail,
            },
            None => PluginError::Failed {
                message: format!("{op} was terminated by a signal"),
                exit_code: None,
                stderr_tail,
            },
        }
    }
}

fn last_line(s: &str) -> Option<&str> {
    s.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Which side of a two-plugin pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Half {
    Target,
    Store,
}

impl std::fmt::Display for Half {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Half::Target => f.write_str("target"),
            Half::Store => f.write_str("store"),
        }
    }
}

#[derive(Error, Debug)]
#[error("{half} plugin '{plugin}' failed during {op}: {source}")]
pub struct PipelineError {
    pub half: Half,
    pub plugin: String,
    pub op: &'static str,
    #[source]
    pub source: PluginError,
}

impl PipelineError {
    pub fn new(half: Half, plugin: &str, op: &'static str, source: PluginError) -> Self {
        Self {
            half,
            plugin: plugin.to_string(),
            op,
            source,
        }
    }
}
