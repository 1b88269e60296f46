//! Archive lifecycle: archives are born from successful backups with a fixed
//! expiry, swept when expired or orphaned, and purged through purge tasks.
//! Records are never deleted, only marked `purged`.

use crate::clock::Clock;
use crate::db::connection::{with_conn, DbPool};
use crate::error::EngineError;
use crate::models::archive::{self, Archive, ArchiveStatus, PurgeReason};
use crate::models::retention::expiry_for_job;
use crate::models::task::{NewTask, Task};
use crate::models::new_uuid;
use crate::services::engine::{TaskEngine, TaskHandle};
use custodian_plugin::CommandOutput;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SYSTEM_OWNER: &str = "system";

/// Creates the archive for a backup task that just reached `done`. Runs in
/// the same transaction that finished the task.
pub fn record_archive(
    conn: &Connection,
    task: &Task,
    output: &CommandOutput,
    orphan_retention_secs: i64,
) -> anyhow::Result<Archive> {
    let store_key = output
        .key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("backup task {} finished without a store key", task.uuid))?;
    let taken_at = task
        .stopped_at
        .ok_or_else(|| anyhow::anyhow!("backup task {} has no stop time", task.uuid))?;
    let expiry = match &task.job_uuid {
        Some(job) => expiry_for_job(conn, job)?.unwrap_or(orphan_retention_secs),
        None => orphan_retention_secs,
    };

    let record = Archive {
        uuid: new_uuid(),
        job_uuid: task.job_uuid.clone(),
        target_uuid: task.target_uuid.clone().unwrap_or_default(),
        store_uuid: task.store_uuid.clone().unwrap_or_default(),
        store_key,
        taken_at,
        expires_at: taken_at + expiry,
        notes: String::new(),
        purge_reason: None,
        status: ArchiveStatus::Valid,
        size: output.size.unwrap_or_default(),
        compression: task.compression,
        agent: task.agent.clone(),
        store_plugin: task.store_plugin.clone(),
        store_endpoint: task.store_endpoint.clone(),
        purge_failures: 0,
    };
    archive::insert(conn, &record)?;
    tracing::info!(
        task_id = %task.uuid,
        archive_id = %record.uuid,
        expires_at = record.expires_at,
        "Archive recorded"
    );
    Ok(record)
}

/// A purge task reached `done`: the stored object is gone.
pub fn complete_purge(conn: &Connection, task: &Task) -> anyhow::Result<()> {
    let Some(archive_uuid) = &task.archive_uuid else {
        return Ok(());
    };
    let reason = task.purge_reason.unwrap_or(PurgeReason::Manual);
    if archive::mark_purged(conn, archive_uuid, reason)? {
        tracing::info!(archive_id = %archive_uuid, reason = %reason, "Archive purged");
    }
    Ok(())
}

/// A purge task failed: the archive stays valid for the next sweep. Repeated
/// failures on one archive raise an operator alert.
pub fn fail_purge(conn: &Connection, task: &Task, alert_threshold: i64) -> anyhow::Result<i64> {
    let Some(archive_uuid) = &task.archive_uuid else {
        return Ok(0);
    };
    let failures = archive::record_purge_failure(conn, archive_uuid)?;
    if failures >= alert_threshold {
        tracing::error!(
            archive_id = %archive_uuid,
            failures,
            "Archive has failed to purge {failures} times; the stored object may need manual cleanup"
        );
    } else {
        tracing::warn!(archive_id = %archive_uuid, failures, "Archive purge failed; will retry");
    }
    Ok(failures)
}

pub struct RetentionManager {
    db: DbPool,
    clock: Arc<dyn Clock>,
    engine: Arc<TaskEngine>,
}

impl RetentionManager {
    pub fn new(db: DbPool, clock: Arc<dyn Clock>, engine: Arc<TaskEngine>) -> Self {
        Self { db, clock, engine }
    }

    /// Valid archives that are expired at `now` or whose target or store is
    /// gone, oldest expiry first.
    pub async fn sweep_expired(&self, now: i64) -> anyhow::Result<Vec<(Archive, PurgeReason)>> {
        with_conn(&self.db, move |conn| archive::find_purge_candidates(conn, now)).await
    }

    /// Dispatches a purge task for one archive. The archive flips to
    /// `purged` only when that task succeeds.
    pub async fn purge(&self, archive_uuid: &str, reason: PurgeReason, owner: &str) -> Result<TaskHandle, EngineError> {
        let uuid = archive_uuid.to_string();
        let found = with_conn(&self.db, move |conn| archive::find_by_id(conn, &uuid)).await?;
        let record = found.ok_or_else(|| EngineError::NotFound(format!("archive {archive_uuid}")))?;
        if record.status != ArchiveStatus::Valid {
            return Err(EngineError::InvalidState(format!(
                "archive {archive_uuid} is {}, only valid archives can be purged",
                record.status.as_str()
            )));
        }
        self.engine.submit(NewTask::purge(&record, reason, owner)).await
    }

    /// One sweep: submits a purge for every candidate not already being purged.
    pub async fn sweep(&self) -> anyhow::Result<Vec<TaskHandle>> {
        let now = self.clock.now_ts();
        let candidates = self.sweep_expired(now).await?;
        let mut handles = Vec::new();
        for (record, reason) in candidates {
            match self.engine.submit(NewTask::purge(&record, reason, SYSTEM_OWNER)).await {
                Ok(handle) => {
                    tracing::debug!(archive_id = %record.uuid, task_id = %handle.uuid, reason = %reason, "Purge dispatched");
                    handles.push(handle);
                }
                Err(EngineError::Busy(_)) => {
                    tracing::debug!(archive_id = %record.uuid, "Purge already in flight");
                }
                Err(e) => tracing::warn!(archive_id = %record.uuid, "Failed to dispatch purge: {e}"),
            }
        }
        if !handles.is_empty() {
            tracing::info!("Retention sweep dispatched {} purge task(s)", handles.len());
        }
        Ok(handles)
    }

    pub async fn run(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!("Retention sweep failed: {e:#}");
                    }
                }
            }
        }
        tracing::info!("Retention sweeper stopped");
    }
}
