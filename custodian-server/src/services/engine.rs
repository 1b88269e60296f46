//! Task execution: `pending -> running -> {done, failed, cancelled}`.
//!
//! Every task holds exclusive claims on the resources it touches (its target,
//! its job, the archive it operates on) from submission until it reaches a
//! terminal state. Execution runs on a bounded pool and races against the
//! task's deadline and its cancellation token; losing that race drops the
//! execution future, which terminates the plugin processes behind it.

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::connection::{with_conn, DbPool};
use crate::error::{EngineError, TaskError};
use crate::models::archive::{self, Archive, ArchiveStatus};
use crate::models::task::{self, NewTask, Snapshot, Task, TaskStatus};
use crate::models::{store, target};
use crate::services::retention;
use crate::services::transport::{AgentTransport, DispatchError};
use custodian_plugin::{Command, CommandOutput, Compression, Half, LogSink, Operation};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long a finishing task waits for its log lines to reach the database.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_tasks: usize,
    pub task_timeout: Duration,
    pub max_attempts: u32,
    pub agent_retry: Duration,
    pub orphan_retention_secs: i64,
    pub purge_alert_threshold: i64,
    pub default_agent: String,
    pub compression: Compression,
}

impl From<&AppConfig> for EngineConfig {
    fn from(c: &AppConfig) -> Self {
        Self {
            max_concurrent_tasks: c.max_concurrent_tasks,
            task_timeout: c.task_timeout,
            max_attempts: c.max_task_attempts,
            agent_retry: c.agent_retry,
            orphan_retention_secs: c.orphan_retention_secs,
            purge_alert_threshold: c.purge_alert_threshold,
            default_agent: c.default_agent.clone(),
            compression: c.compression,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// A submitted task. Resolves once the task is terminal.
#[derive(Debug)]
pub struct TaskHandle {
    pub uuid: String,
    status: watch::Receiver<Option<TaskStatus>>,
}

impl TaskHandle {
    pub async fn wait(mut self) -> TaskStatus {
        match self.status.wait_for(Option::is_some).await {
            Ok(status) => status.unwrap_or(TaskStatus::Failed),
            Err(_) => TaskStatus::Failed,
        }
    }
}

struct InFlight {
    token: CancellationToken,
    status: watch::Receiver<Option<TaskStatus>>,
}

enum Outcome {
    Done(CommandOutput),
    Failed(TaskError),
    Cancelled(TaskError),
}

pub struct TaskEngine {
    db: DbPool,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn AgentTransport>,
    config: EngineConfig,
    claims: Mutex<HashSet<String>>,
    inflight: DashMap<String, InFlight>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskEngine {
    pub fn new(db: DbPool, clock: Arc<dyn Clock>, transport: Arc<dyn AgentTransport>, config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            db,
            clock,
            transport,
            config,
            claims: Mutex::new(HashSet::new()),
            inflight: DashMap::new(),
            permits,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Records a new pending task and starts it. Fails with `Busy`, without
    /// recording anything, when a conflicting task is in flight.
    pub async fn submit(self: &Arc<Self>, new: NewTask) -> Result<TaskHandle, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::InvalidState("engine is shutting down".into()));
        }
        let keys = new.exclusive_keys();
        self.claim(&keys).await?;

        let now = self.clock.now_ts();
        let timeout_at = now + self.config.task_timeout.as_secs() as i64;
        let inserted = with_conn(&self.db, move |conn| task::insert(conn, &new, now, timeout_at)).await;
        let record = match inserted {
            Ok(t) => t,
            Err(e) => {
                self.release(&keys).await;
                return Err(EngineError::Database(e));
            }
        };

        tracing::info!(task_id = %record.uuid, op = %record.op, owner = %record.owner, "Task submitted");
        Ok(self.start(record, keys, Instant::now() + self.config.task_timeout))
    }

    async fn claim(&self, keys: &[String]) -> Result<(), EngineError> {
        let mut claims = self.claims.lock().await;
        if let Some(busy) = keys.iter().find(|k| claims.contains(*k)) {
            return Err(EngineError::Busy(busy.clone()));
        }
        claims.extend(keys.iter().cloned());
        Ok(())
    }

    async fn release(&self, keys: &[String]) {
        let mut claims = self.claims.lock().await;
        for key in keys {
            claims.remove(key);
        }
    }

    fn start(self: &Arc<Self>, record: Task, keys: Vec<String>, deadline: Instant) -> TaskHandle {
        let token = self.shutdown.child_token();
        let (status_tx, status_rx) = watch::channel(None);
        self.inflight.insert(
            record.uuid.clone(),
            InFlight {
                token: token.clone(),
                status: status_rx.clone(),
            },
        );

        let uuid = record.uuid.clone();
        let engine = self.clone();
        self.tracker.spawn(async move {
            let task_uuid = record.uuid.clone();
            let status = engine.run(record, token, deadline).await;
            engine.release(&keys).await;
            engine.inflight.remove(&task_uuid);
            let _ = status_tx.send(Some(status));
        });

        TaskHandle { uuid, status: status_rx }
    }

    async fn run(&self, record: Task, token: CancellationToken, deadline: Instant) -> TaskStatus {
        let (log, appender) = self.task_log(&record.uuid);

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                if self.shutdown.is_cancelled() {
                    Outcome::Cancelled(TaskError::Shutdown)
                } else {
                    Outcome::Cancelled(TaskError::Cancelled)
                }
            }
            _ = tokio::time::sleep_until(deadline) => Outcome::Cancelled(TaskError::TimeoutExceeded),
            outcome = self.execute(&record, log.clone()) => outcome,
        };

        drop(log);
        if tokio::time::timeout(LOG_DRAIN_TIMEOUT, appender).await.is_err() {
            tracing::warn!(task_id = %record.uuid, "Timed out flushing task log");
        }

        match self.finish(&record, outcome).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(task_id = %record.uuid, "Failed to record task outcome: {e:#}");
                TaskStatus::Failed
            }
        }
    }

    /// A log sink that forwards lines to a background appender, so plugin
    /// output never waits on the database.
    fn task_log(&self, uuid: &str) -> (LogSink, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let db = self.db.clone();
        let uuid = uuid.to_string();
        let appender = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let mut chunk = line;
                while let Ok(more) = rx.try_recv() {
                    chunk.push_str(&more);
                }
                let uuid = uuid.clone();
                if let Err(e) = with_conn(&db, move |conn| task::append_log(conn, &uuid, &chunk)).await {
                    tracing::warn!("Failed to append task log: {e:#}");
                }
            }
        });
        let log: LogSink = Arc::new(move |line: &str| {
            let _ = tx.send(format!("{}\n", line.trim_end_matches('\n')));
        });
        (log, appender)
    }

    async fn execute(&self, record: &Task, log: LogSink) -> Outcome {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return Outcome::Cancelled(TaskError::Shutdown),
        };

        let snap = match self.snapshot(record).await {
            Ok(s) => s,
            Err(e) => return Outcome::Failed(e),
        };

        let uuid = record.uuid.clone();
        let started = self.clock.now_ts();
        let pinned = snap.clone();
        match with_conn(&self.db, move |conn| task::mark_running(conn, &uuid, started, &pinned)).await {
            Ok(true) => {}
            Ok(false) => return Outcome::Cancelled(TaskError::Cancelled),
            Err(e) => return Outcome::Failed(TaskError::Internal(format!("{e:#}"))),
        }
        tracing::info!(task_id = %record.uuid, op = %record.op, agent = %snap.agent, "Task running");

        let cmd = command_for(record, &snap);
        let max = self.config.max_attempts.max(1);
        loop {
            let uuid = record.uuid.clone();
            let attempt = match with_conn(&self.db, move |conn| task::increment_attempts(conn, &uuid)).await {
                Ok(n) => n as u32,
                Err(e) => return Outcome::Failed(TaskError::Internal(format!("{e:#}"))),
            };
            log(&format!(
                "dispatching {} to agent '{}' (attempt {attempt} of {max})",
                record.op, snap.agent
            ));

            match self.transport.execute(&snap.agent, cmd.clone(), log.clone()).await {
                Ok(output) => return Outcome::Done(output),
                Err(DispatchError::Unreachable { agent, reason }) => {
                    if attempt >= max {
                        return Outcome::Failed(TaskError::AgentUnreachable {
                            agent,
                            attempts: attempt,
                            reason,
                        });
                    }
                    tracing::warn!(task_id = %record.uuid, agent = %agent, attempt, "Agent unreachable: {reason}");
                    log(&format!("agent '{agent}' unreachable ({reason}); retrying"));
                    tokio::time::sleep(self.config.agent_retry).await;
                }
                Err(DispatchError::Execution { kind, half, message }) => {
                    return Outcome::Failed(match (record.op, &record.archive_uuid) {
                        (Operation::Purge, Some(archive)) => TaskError::PurgeFailed {
                            archive: archive.clone(),
                            message,
                        },
                        _ => TaskError::from_failure(kind, half, message),
                    });
                }
            }
        }
    }

    /// Resolves what the task will run against. Live catalog entries win;
    /// an archive's own record of its store covers a store deleted since.
    async fn snapshot(&self, record: &Task) -> Result<Snapshot, TaskError> {
        let record = record.clone();
        let config = self.config.clone();
        let resolved = with_conn(&self.db, move |conn| {
            let archive = match &record.archive_uuid {
                Some(uuid) => Some(
                    archive::find_by_id(conn, uuid)?
                        .ok_or_else(|| anyhow::anyhow!(TaskError::Snapshot(format!("archive {uuid} no longer exists"))))?,
                ),
                None => None,
            };
            if let Some(a) = &archive {
                if a.status != ArchiveStatus::Valid {
                    anyhow::bail!(TaskError::Snapshot(format!(
                        "archive {} is {}",
                        a.uuid,
                        a.status.as_str()
                    )));
                }
            }
            let live_target = match &record.target_uuid {
                Some(uuid) => target::find_by_id(conn, uuid)?,
                None => None,
            };
            let live_store = match &record.store_uuid {
                Some(uuid) => store::find_by_id(conn, uuid)?,
                None => None,
            };
            resolve_snapshot(&record, archive.as_ref(), live_target, live_store, &config).map_err(anyhow::Error::new)
        })
        .await;

        resolved.map_err(|e| match e.downcast::<TaskError>() {
            Ok(task_err) => task_err,
            Err(other) => TaskError::Internal(format!("{other:#}")),
        })
    }

    async fn finish(&self, record: &Task, outcome: Outcome) -> anyhow::Result<TaskStatus> {
        let outcome = match outcome {
            Outcome::Done(out) if record.op == Operation::Backup && out.key.is_none() => {
                Outcome::Failed(TaskError::PluginExecution {
                    half: Some(Half::Store),
                    message: "store finished without returning a key".into(),
                })
            }
            other => other,
        };

        let (status, line, output, error) = match outcome {
            Outcome::Done(out) => (TaskStatus::Done, format!("{} completed\n", record.op), Some(out), None),
            Outcome::Failed(e) => (TaskStatus::Failed, format!("FAILED: {e}\n"), None, Some(e)),
            Outcome::Cancelled(e) => (TaskStatus::Cancelled, format!("CANCELLED: {e}\n"), None, Some(e)),
        };
        match &error {
            Some(e) => tracing::warn!(task_id = %record.uuid, status = %status, "Task ended: {e}"),
            None => tracing::info!(task_id = %record.uuid, "Task done"),
        }

        let uuid = record.uuid.clone();
        let now = self.clock.now_ts();
        let orphan_retention = self.config.orphan_retention_secs;
        let alert_threshold = self.config.purge_alert_threshold;
        let purge_failed = matches!(error, Some(TaskError::PurgeFailed { .. }));

        with_conn(&self.db, move |conn| {
            let tx = conn.transaction()?;
            if !task::finish(&tx, &uuid, status, now, &line)? {
                // Already terminal.
                let current = task::find_by_id(&tx, &uuid)?.map(|t| t.status);
                return Ok(current.unwrap_or(status));
            }
            let finished = task::find_by_id(&tx, &uuid)?
                .ok_or_else(|| anyhow::anyhow!("task {uuid} vanished while finishing"))?;
            match (finished.op, status, &output) {
                (Operation::Backup, TaskStatus::Done, Some(out)) => {
                    retention::record_archive(&tx, &finished, out, orphan_retention)?;
                }
                (Operation::Purge, TaskStatus::Done, _) => retention::complete_purge(&tx, &finished)?,
                (Operation::Purge, TaskStatus::Failed, _) if purge_failed => {
                    retention::fail_purge(&tx, &finished, alert_threshold)?;
                }
                _ => {}
            }
            tx.commit()?;
            Ok(status)
        })
        .await
    }

    /// Cancels a task. Safe to repeat; a terminal task keeps its status.
    pub async fn cancel(&self, uuid: &str) -> Result<TaskStatus, EngineError> {
        let flight = self
            .inflight
            .get(uuid)
            .map(|f| (f.token.clone(), f.status.clone()));
        if let Some((token, mut status)) = flight {
            tracing::info!(task_id = %uuid, "Cancelling task");
            token.cancel();
            if let Ok(done) = status.wait_for(Option::is_some).await {
                if let Some(s) = *done {
                    return Ok(s);
                }
            }
        }

        let id = uuid.to_string();
        let now = self.clock.now_ts();
        with_conn(&self.db, move |conn| {
            let Some(current) = task::find_by_id(conn, &id)? else {
                return Ok(None);
            };
            if current.status.is_terminal() {
                return Ok(Some(current.status));
            }
            // Not running in this process; nothing to stop.
            task::finish(conn, &id, TaskStatus::Cancelled, now, "CANCELLED: task was cancelled on request\n")?;
            Ok(task::find_by_id(conn, &id)?.map(|t| t.status))
        })
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("task {uuid}")))
    }

    /// Startup recovery: tasks a previous process left `running` are failed,
    /// `pending` ones are started again.
    pub async fn recover(self: &Arc<Self>) -> Result<Vec<TaskHandle>, EngineError> {
        let now = self.clock.now_ts();
        let (interrupted, pending) = with_conn(&self.db, move |conn| {
            let running = task::find_by_status(conn, TaskStatus::Running)?;
            for t in &running {
                task::finish(conn, &t.uuid, TaskStatus::Failed, now, "FAILED: interrupted by server restart\n")?;
            }
            Ok((running.len(), task::find_by_status(conn, TaskStatus::Pending)?))
        })
        .await?;
        if interrupted > 0 {
            tracing::warn!("Failed {interrupted} task(s) interrupted by the previous shutdown");
        }

        let mut handles = Vec::new();
        for record in pending {
            let keys = NewTask::from(&record).exclusive_keys();
            if let Err(e) = self.claim(&keys).await {
                let uuid = record.uuid.clone();
                let line = format!("FAILED: {e}\n");
                with_conn(&self.db, move |conn| task::finish(conn, &uuid, TaskStatus::Failed, now, &line)).await?;
                continue;
            }
            let remaining = (record.timeout_at - now).max(0) as u64;
            tracing::info!(task_id = %record.uuid, "Resuming pending task");
            handles.push(self.start(record, keys, Instant::now() + Duration::from_secs(remaining)));
        }
        Ok(handles)
    }

    /// Cancels everything in flight and waits for it to settle.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("{} task(s) still settling at shutdown", self.inflight.len());
        }
    }
}

fn resolve_snapshot(
    record: &Task,
    archive: Option<&Archive>,
    live_target: Option<target::Target>,
    live_store: Option<store::Store>,
    config: &EngineConfig,
) -> Result<Snapshot, TaskError> {
    let needs_target = matches!(record.op, Operation::Backup | Operation::Restore);
    if needs_target && live_target.is_none() {
        return Err(TaskError::Snapshot(format!(
            "target {} no longer exists",
            record.target_uuid.as_deref().unwrap_or("(none)")
        )));
    }

    let (store_plugin, store_endpoint) = match (live_store, archive) {
        (Some(s), _) => (s.plugin, s.endpoint),
        (None, Some(a)) if !a.store_plugin.is_empty() => (a.store_plugin.clone(), a.store_endpoint.clone()),
        _ => {
            return Err(TaskError::Snapshot(format!(
                "store {} no longer exists",
                record.store_uuid.as_deref().unwrap_or("(none)")
            )))
        }
    };

    let agent = [
        live_target.as_ref().map(|t| t.agent.as_str()),
        archive.map(|a| a.agent.as_str()),
    ]
    .into_iter()
    .flatten()
    .find(|a| !a.is_empty())
    .unwrap_or(config.default_agent.as_str())
    .to_string();

    let (target_plugin, target_endpoint) = match (needs_target, live_target) {
        (true, Some(t)) => (t.plugin, t.endpoint),
        _ => Default::default(),
    };

    let compression = match (record.op, archive) {
        (Operation::Backup, _) => config.compression,
        (_, Some(a)) => a.compression,
        _ => Compression::None,
    };

    Ok(Snapshot {
        agent,
        target_plugin,
        target_endpoint,
        store_plugin,
        store_endpoint,
        restore_key: archive.map(|a| a.store_key.clone()),
        compression,
    })
}

fn command_for(record: &Task, snap: &Snapshot) -> Command {
    let mut cmd = Command::new(record.op, &record.uuid)
        .store(&snap.store_plugin, snap.store_endpoint.clone())
        .compression(snap.compression);
    if matches!(record.op, Operation::Backup | Operation::Restore) {
        cmd = cmd.target(&snap.target_plugin, snap.target_endpoint.clone());
    }
    if let Some(key) = &snap.restore_key {
        cmd = cmd.key(key);
    }
    cmd
}
