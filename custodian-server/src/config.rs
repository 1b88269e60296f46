use custodian_plugin::Compression;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub plugin_dir: PathBuf,
    pub log_level: String,
    pub max_concurrent_tasks: usize,
    pub scheduler_tick: Duration,
    pub retention_sweep: Duration,
    pub task_timeout: Duration,
    pub max_task_attempts: u32,
    pub agent_retry: Duration,
    pub agent_ack_timeout: Duration,
    pub purge_alert_threshold: i64,
    pub orphan_retention_secs: i64,
    pub default_agent: String,
    pub compression: Compression,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            port: 3000,
            db_path: data_dir.join("custodian.db"),
            plugin_dir: data_dir.join("plugins"),
            data_dir,
            log_level: "info".into(),
            max_concurrent_tasks: 8,
            scheduler_tick: Duration::from_secs(60),
            retention_sweep: Duration::from_secs(300),
            task_timeout: Duration::from_secs(86_400),
            max_task_attempts: 3,
            agent_retry: Duration::from_secs(10),
            agent_ack_timeout: Duration::from_secs(30),
            purge_alert_threshold: 5,
            orphan_retention_secs: 604_800,
            default_agent: "local".into(),
            compression: Compression::Zstd,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let d = Self::default();

        let data_dir = std::env::var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir);
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("custodian.db"));
        let plugin_dir = std::env::var("PLUGIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("plugins"));

        Self {
            port: env_or("PORT", d.port),
            db_path,
            plugin_dir,
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or(d.log_level),
            max_concurrent_tasks: env_or("MAX_CONCURRENT_TASKS", d.max_concurrent_tasks).max(1),
            scheduler_tick: secs("SCHEDULER_TICK_SECS", d.scheduler_tick),
            retention_sweep: secs("RETENTION_SWEEP_SECS", d.retention_sweep),
            task_timeout: secs("TASK_TIMEOUT_SECS", d.task_timeout),
            max_task_attempts: env_or("MAX_TASK_ATTEMPTS", d.max_task_attempts).max(1),
            agent_retry: secs("AGENT_RETRY_SECS", d.agent_retry),
            agent_ack_timeout: secs("AGENT_ACK_TIMEOUT_SECS", d.agent_ack_timeout),
            purge_alert_threshold: env_or("PURGE_ALERT_THRESHOLD", d.purge_alert_threshold),
            orphan_retention_secs: env_or("ORPHAN_RETENTION_SECS", d.orphan_retention_secs),
            default_agent: std::env::var("DEFAULT_AGENT").unwrap_or(d.default_agent),
            compression: env_or("COMPRESSION", d.compression),
        }
    }
}
