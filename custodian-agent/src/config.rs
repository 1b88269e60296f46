//! Agent configuration.
//!
//! Built-in defaults, then an optional TOML file, then `CUSTODIAN_AGENT__*`
//! environment variables (`CUSTODIAN_AGENT__SERVER__URL=...`). Command line
//! flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::AgentError;

pub const ENV_PREFIX: &str = "CUSTODIAN_AGENT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name this agent registers under; targets reference it as their agent.
    pub name: String,

    /// Port for the local health endpoints.
    pub port: u16,

    /// Directory holding plugin executables.
    pub plugin_dir: PathBuf,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the custodian server, e.g. `http://backup.internal:3000`.
    pub url: String,

    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_reconnect_min_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent: AgentConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "custodian-agent".to_string()),
                port: 9990,
                plugin_dir: PathBuf::from("/usr/lib/custodian/plugins"),
                max_concurrent_tasks: default_max_concurrent_tasks(),
            },
            server: ServerConfig {
                url: "http://localhost:3000".to_string(),
                reconnect_min_ms: default_reconnect_min_ms(),
                reconnect_max_ms: default_reconnect_max_ms(),
            },
            log: LogConfig {
                level: default_log_level(),
            },
        }
    }
}

impl Config {
    /// Loads defaults, `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        Self::layered(path, environment())
    }

    /// Same as [`Config::load`] but with an explicit environment source.
    pub fn layered(path: Option<&Path>, env: config::Environment) -> Result<Self, AgentError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), AgentError> {
        if self.agent.name.trim().is_empty() {
            return Err(AgentError::Config("agent.name must not be empty".into()));
        }
        if self.agent.max_concurrent_tasks == 0 {
            return Err(AgentError::Config("agent.max_concurrent_tasks must be at least 1".into()));
        }
        if self.server.reconnect_min_ms == 0 || self.server.reconnect_min_ms > self.server.reconnect_max_ms {
            return Err(AgentError::Config(
                "server.reconnect_min_ms must be positive and not exceed server.reconnect_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, AgentError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn reconnect_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.server.reconnect_min_ms),
            Duration::from_millis(self.server.reconnect_max_ms),
        )
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
