use crate::clock::{from_ts, Clock};
use crate::db::connection::{with_conn, DbPool};
use crate::error::EngineError;
use crate::models::job::{self, Job, JobFilter};
use crate::models::schedule;
use crate::models::task::NewTask;
use crate::services::engine::{TaskEngine, TaskHandle};
use crate::timespec::{next_run, Spec};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SCHEDULER_OWNER: &str = "scheduler";

/// Turns due jobs into backup tasks.
pub struct Scheduler {
    db: DbPool,
    clock: Arc<dyn Clock>,
    engine: Arc<TaskEngine>,
}

impl Scheduler {
    pub fn new(db: DbPool, clock: Arc<dyn Clock>, engine: Arc<TaskEngine>) -> Self {
        Self { db, clock, engine }
    }

    /// One pass over the unpaused jobs. A job without a next run gets one
    /// computed from now; due jobs are submitted most urgent first. A job
    /// whose target is busy stays due for the next tick.
    pub async fn tick(&self) -> anyhow::Result<Vec<TaskHandle>> {
        let now = self.clock.now();
        let now_ts = now.timestamp();

        let jobs = with_conn(&self.db, |conn| {
            let filter = JobFilter {
                paused: Some(false),
                ..Default::default()
            };
            let mut out = Vec::new();
            for j in job::find_all(conn, &filter)? {
                let timespec = schedule::find_by_id(conn, &j.schedule_uuid)?.map(|s| s.timespec);
                out.push((j, timespec));
            }
            Ok(out)
        })
        .await?;

        let mut due: Vec<(Job, Spec, i64)> = Vec::new();
        for (j, timespec) in jobs {
            let Some(text) = timespec else {
                tracing::warn!(job_id = %j.uuid, "Job references missing schedule {}", j.schedule_uuid);
                continue;
            };
            let spec: Spec = match text.parse() {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::warn!(job_id = %j.uuid, "Skipping job with bad schedule: {e}");
                    continue;
                }
            };
            let next = match j.next_run {
                Some(next) => next,
                None => {
                    let next = next_run(&spec, now).timestamp();
                    let uuid = j.uuid.clone();
                    with_conn(&self.db, move |conn| job::set_next_run(conn, &uuid, next)).await?;
                    tracing::debug!(job_id = %j.uuid, next_run = %from_ts(next), "Job scheduled");
                    next
                }
            };
            if next <= now_ts {
                due.push((j, spec, next));
            }
        }
        due.sort_by(|a, b| (a.0.priority, a.2).cmp(&(b.0.priority, b.2)));

        let mut handles = Vec::new();
        for (j, spec, _) in due {
            match self.engine.submit(NewTask::backup(&j, SCHEDULER_OWNER)).await {
                Ok(handle) => {
                    let following = next_run(&spec, now).timestamp();
                    let uuid = j.uuid.clone();
                    with_conn(&self.db, move |conn| job::record_run(conn, &uuid, now_ts, following)).await?;
                    tracing::info!(job_id = %j.uuid, task_id = %handle.uuid, next_run = %from_ts(following), "Job dispatched");
                    handles.push(handle);
                }
                Err(EngineError::Busy(key)) => {
                    tracing::debug!(job_id = %j.uuid, "Job due but {key} is busy");
                }
                Err(e) => tracing::warn!(job_id = %j.uuid, "Failed to dispatch job: {e}"),
            }
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
                    if let Err(e) = self.tick().await {
                        tracing::warn!("Scheduler tick failed: {e:#}");
                    }
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
