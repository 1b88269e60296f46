#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custodian_plugin::builtin::MemoryStore;
use custodian_plugin::plugin::{ByteSink, ByteSource};
use custodian_plugin::{Endpoint, Features, Plugin, PluginDir, PluginError, PluginInfo, PluginRegistry};
use custodian_server::clock::ManualClock;
use custodian_server::config::AppConfig;
use custodian_server::db::connection::{create_pool, with_conn};
use custodian_server::db::migrate::migrate;
use custodian_server::models::job::{self, Job, NewJob};
use custodian_server::models::retention::{self, NewRetention};
use custodian_server::models::schedule::{self, NewSchedule};
use custodian_server::models::store::{self, NewStore};
use custodian_server::models::target::{self, NewTarget};
use custodian_server::state::AppState;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;

pub const PAYLOAD: &[u8] = b"pg_dump output: 42 rows\n";

/// Backs up a fixed payload; remembers what it was asked to restore.
#[derive(Default)]
pub struct BytesTarget {
    pub restored: Mutex<Vec<u8>>,
}

#[async_trait]
impl Plugin for BytesTarget {
    async fn meta(&self) -> Result<PluginInfo, PluginError> {
        Ok(PluginInfo::new("bytes", "tests", "0.1", Features::target()))
    }

    async fn backup(&self, _endpoint: &Endpoint, out: ByteSink<'_>) -> Result<(), PluginError> {
        out.write_all(PAYLOAD).await?;
        out.flush().await?;
        Ok(())
    }

    async fn restore(&self, _endpoint: &Endpoint, input: ByteSource<'_>) -> Result<(), PluginError> {
        let mut data = Vec::new();
        input.read_to_end(&mut data).await?;
        *self.restored.lock().unwrap() = data;
        Ok(())
    }
}

/// A target whose backups block until the test opens the gate.
pub struct GateTarget {
    pub gate: Semaphore,
}

#[async_trait]
impl Plugin for GateTarget {
    async fn meta(&self) -> Result<PluginInfo, PluginError> {
        Ok(PluginInfo::new("gate", "tests", "0.1", Features::target()))
    }

    async fn backup(&self, _endpoint: &Endpoint, out: ByteSink<'_>) -> Result<(), PluginError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| PluginError::failed("gate closed"))?;
        permit.forget();
        out.write_all(PAYLOAD).await?;
        Ok(())
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    pub memory: Arc<MemoryStore>,
    pub bytes: Arc<BytesTarget>,
    pub gate: Arc<GateTarget>,
    pub plugin_dir: PathBuf,
    _dir: TempDir,
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    rfc3339.parse().unwrap()
}

pub fn test_config() -> AppConfig {
    AppConfig {
        agent_retry: std::time::Duration::from_millis(10),
        agent_ack_timeout: std::time::Duration::from_millis(200),
        ..AppConfig::default()
    }
}

pub fn harness(config: AppConfig, start: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = dir.path().join("plugins");
    std::fs::create_dir_all(&plugin_dir).unwrap();

    let pool = create_pool(&dir.path().join("custodian.db")).unwrap();
    migrate(&pool).unwrap();

    let clock = Arc::new(ManualClock::new(at(start)));
    let memory = Arc::new(MemoryStore::new());
    let bytes = Arc::new(BytesTarget::default());
    let gate = Arc::new(GateTarget { gate: Semaphore::new(0) });
    let plugins = PluginRegistry::new()
        .register("memory", memory.clone())
        .register("bytes", bytes.clone())
        .register("gate", gate.clone())
        .with_fallback(Arc::new(PluginDir::new(&plugin_dir)));

    let state = Arc::new(AppState::new(pool, config, clock.clone(), Arc::new(plugins)));
    Harness {
        state,
        clock,
        memory,
        bytes,
        gate,
        plugin_dir,
        _dir: dir,
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A subprocess target plugin: no custom validation, empty schema, and
/// `backup_body` as its backup implementation.
pub fn script_target(dir: &Path, name: &str, backup_body: &str) {
    let body = format!(
        r#"case "$1" in
  info) echo '{{"name":"{name}","author":"tests","version":"0.1","features":{{"target":true,"store":false}},"fields":[]}}' ;;
  backup) {backup_body} ;;
  *) exit 10 ;;
esac"#
    );
    write_script(dir, name, &body);
}

impl Harness {
    pub async fn target(&self, plugin: &str) -> String {
        let data = NewTarget {
            name: format!("{plugin} target"),
            plugin: plugin.into(),
            ..Default::default()
        };
        with_conn(&self.state.db, move |conn| target::create(conn, &data))
            .await
            .unwrap()
            .uuid
    }

    pub async fn store(&self) -> String {
        let data = NewStore {
            name: "memory store".into(),
            plugin: "memory".into(),
            endpoint: Endpoint::new().set("bucket", "backups"),
            ..Default::default()
        };
        with_conn(&self.state.db, move |conn| store::create(conn, &data))
            .await
            .unwrap()
            .uuid
    }

    pub async fn job(&self, target_uuid: &str, store_uuid: &str, timespec: &str, expiry: i64, priority: i64) -> Job {
        let (target_uuid, store_uuid, timespec) = (target_uuid.to_string(), store_uuid.to_string(), timespec.to_string());
        with_conn(&self.state.db, move |conn| {
            let sched = schedule::create(
                conn,
                &NewSchedule {
                    name: timespec.clone(),
                    timespec,
                    ..Default::default()
                },
            )?;
            let policy = retention::create(
                conn,
                &NewRetention {
                    name: format!("{expiry}s"),
                    expiry,
                    ..Default::default()
                },
            )?;
            job::create(
                conn,
                &NewJob {
                    name: format!("job p{priority}"),
                    summary: String::new(),
                    target_uuid,
                    store_uuid,
                    schedule_uuid: sched.uuid,
                    retention_uuid: policy.uuid,
                    priority,
                    paused: false,
                },
            )
        })
        .await
        .unwrap()
    }
}

impl Harness {
    pub fn clock_now(&self) -> i64 {
        use custodian_server::clock::Clock;
        self.clock.now_ts()
    }
}
