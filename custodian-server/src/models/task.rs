use super::archive::{Archive, PurgeReason};
use super::{endpoint_column, new_uuid};
use custodian_plugin::{Compression, Endpoint, Operation};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

fn parsed_column<T>(row: &Row, name: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(name)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub uuid: String,
    pub owner: String,
    pub op: Operation,
    pub job_uuid: Option<String>,
    pub archive_uuid: Option<String>,
    pub target_uuid: Option<String>,
    pub store_uuid: Option<String>,
    pub status: TaskStatus,
    pub requested_at: i64,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub timeout_at: i64,
    pub attempts: i64,
    pub agent: String,
    pub target_plugin: String,
    pub target_endpoint: Endpoint,
    pub store_plugin: String,
    pub store_endpoint: Endpoint,
    pub restore_key: Option<String>,
    pub compression: Compression,
    /// Recorded on the archive when a purge task succeeds.
    pub purge_reason: Option<PurgeReason>,
    pub log: String,
}

/// A request for work, before the engine has assigned it an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub owner: String,
    pub op: Operation,
    pub job_uuid: Option<String>,
    pub archive_uuid: Option<String>,
    pub target_uuid: Option<String>,
    pub store_uuid: Option<String>,
    pub purge_reason: Option<PurgeReason>,
}

impl NewTask {
    fn new(op: Operation, owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            op,
            job_uuid: None,
            archive_uuid: None,
            target_uuid: None,
            store_uuid: None,
            purge_reason: None,
        }
    }

    pub fn backup(job: &super::job::Job, owner: &str) -> Self {
        Self {
            job_uuid: Some(job.uuid.clone()),
            target_uuid: Some(job.target_uuid.clone()),
            store_uuid: Some(job.store_uuid.clone()),
            ..Self::new(Operation::Backup, owner)
        }
    }

    /// Restores `archive` into `target_uuid`, or into the target it was taken from.
    pub fn restore(archive: &Archive, target_uuid: Option<&str>, owner: &str) -> Self {
        Self {
            archive_uuid: Some(archive.uuid.clone()),
            target_uuid: Some(target_uuid.unwrap_or(&archive.target_uuid).to_string()),
            store_uuid: Some(archive.store_uuid.clone()),
            ..Self::new(Operation::Restore, owner)
        }
    }

    pub fn purge(archive: &Archive, reason: PurgeReason, owner: &str) -> Self {
        Self {
            archive_uuid: Some(archive.uuid.clone()),
            target_uuid: Some(archive.target_uuid.clone()),
            store_uuid: Some(archive.store_uuid.clone()),
            purge_reason: Some(reason),
            ..Self::new(Operation::Purge, owner)
        }
    }

    pub fn test_store(store_uuid: &str, owner: &str) -> Self {
        Self {
            store_uuid: Some(store_uuid.to_string()),
            ..Self::new(Operation::TestStore, owner)
        }
    }

    /// Resources this task holds exclusively while in flight: its target,
    /// its job and the archive it operates on.
    pub fn exclusive_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(t) = &self.target_uuid {
            keys.push(format!("target:{t}"));
        }
        if let Some(j) = &self.job_uuid {
            keys.push(format!("job:{j}"));
        }
        if let Some(a) = &self.archive_uuid {
            keys.push(format!("archive:{a}"));
        }
        keys
    }
}

impl From<&Task> for NewTask {
    fn from(t: &Task) -> Self {
        Self {
            owner: t.owner.clone(),
            op: t.op,
            job_uuid: t.job_uuid.clone(),
            archive_uuid: t.archive_uuid.clone(),
            target_uuid: t.target_uuid.clone(),
            store_uuid: t.store_uuid.clone(),
            purge_reason: t.purge_reason,
        }
    }
}

/// What actually ran: pinned onto the task when it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub agent: String,
    pub target_plugin: String,
    pub target_endpoint: Endpoint,
    pub store_plugin: String,
    pub store_endpoint: Endpoint,
    pub restore_key: Option<String>,
    pub compression: Compression,
}

fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        uuid: row.get("uuid")?,
        owner: row.get("owner")?,
        op: parsed_column(row, "op")?,
        job_uuid: row.get("job_uuid")?,
        archive_uuid: row.get("archive_uuid")?,
        target_uuid: row.get("target_uuid")?,
        store_uuid: row.get("store_uuid")?,
        status: row.get("status")?,
        requested_at: row.get("requested_at")?,
        started_at: row.get("started_at")?,
        stopped_at: row.get("stopped_at")?,
        timeout_at: row.get("timeout_at")?,
        attempts: row.get("attempts")?,
        agent: row.get("agent")?,
        target_plugin: row.get("target_plugin")?,
        target_endpoint: endpoint_column(row, "target_endpoint")?,
        store_plugin: row.get("store_plugin")?,
        store_endpoint: endpoint_column(row, "store_endpoint")?,
        restore_key: row.get("restore_key")?,
        compression: parsed_column(row, "compression")?,
        purge_reason: row
            .get::<_, Option<String>>("purge_reason")?
            .map(|r| r.parse())
            .transpose()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))?,
        log: row.get("log")?,
    })
}

pub fn insert(conn: &Connection, data: &NewTask, requested_at: i64, timeout_at: i64) -> anyhow::Result<Task> {
    let uuid = new_uuid();
    conn.execute(
        "INSERT INTO tasks (uuid, owner, op, job_uuid, archive_uuid, target_uuid, store_uuid, status,
                            requested_at, timeout_at, purge_reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10)",
        params![
            uuid,
            data.owner,
            data.op.as_str(),
            data.job_uuid,
            data.archive_uuid,
            data.target_uuid,
            data.store_uuid,
            requested_at,
            timeout_at,
            data.purge_reason.map(|r| r.as_str()),
        ],
    )?;
    find_by_id(conn, &uuid)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created task"))
}

pub fn find_by_id(conn: &Connection, uuid: &str) -> anyhow::Result<Option<Task>> {
    Ok(conn
        .query_row("SELECT * FROM tasks WHERE uuid = ?", params![uuid], row_to_task)
        .optional()?)
}

pub fn find_all(conn: &Connection, status: Option<TaskStatus>, limit: i64) -> anyhow::Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM tasks WHERE (?1 IS NULL OR status = ?1) ORDER BY requested_at DESC, rowid DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![status, limit], row_to_task)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn find_by_status(conn: &Connection, status: TaskStatus) -> anyhow::Result<Vec<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE status = ? ORDER BY requested_at, rowid")?;
    let rows = stmt.query_map(params![status], row_to_task)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// `pending` to `running`, pinning the snapshot. False if the task already left `pending`.
pub fn mark_running(conn: &Connection, uuid: &str, started_at: i64, snap: &Snapshot) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'running', started_at = ?1, agent = ?2,
                target_plugin = ?3, target_endpoint = ?4, store_plugin = ?5, store_endpoint = ?6,
                restore_key = ?7, compression = ?8
         WHERE uuid = ?9 AND status = 'pending'",
        params![
            started_at,
            snap.agent,
            snap.target_plugin,
            snap.target_endpoint.to_json(),
            snap.store_plugin,
            snap.store_endpoint.to_json(),
            snap.restore_key,
            snap.compression.as_str(),
            uuid,
        ],
    )?;
    Ok(changed == 1)
}

pub fn increment_attempts(conn: &Connection, uuid: &str) -> anyhow::Result<i64> {
    conn.execute("UPDATE tasks SET attempts = attempts + 1 WHERE uuid = ?", params![uuid])?;
    Ok(conn.query_row("SELECT attempts FROM tasks WHERE uuid = ?", params![uuid], |r| r.get(0))?)
}

pub fn append_log(conn: &Connection, uuid: &str, text: &str) -> anyhow::Result<()> {
    conn.execute("UPDATE tasks SET log = log || ?1 WHERE uuid = ?2", params![text, uuid])?;
    Ok(())
}

/// Moves a non-terminal task to `status`. Terminal tasks are never touched,
/// which makes repeated cancels and late completions harmless. A task that
/// never started gets `started_at = stopped_at`.
pub fn finish(conn: &Connection, uuid: &str, status: TaskStatus, stopped_at: i64, log_line: &str) -> anyhow::Result<bool> {
    debug_assert!(status.is_terminal());
    let changed = conn.execute(
        "UPDATE tasks SET status = ?1,
                started_at = COALESCE(started_at, ?2),
                stopped_at = MAX(?2, COALESCE(started_at, ?2)),
                log = log || ?3
         WHERE uuid = ?4 AND status IN ('pending', 'running')",
        params![status, stopped_at, log_line, uuid],
    )?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::apply_schema;

    fn conn() -> Connection {
        let c = Connection::open_in_memory().unwrap();
        apply_schema(&c).unwrap();
        c
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            agent: "local".into(),
            target_plugin: "pg".into(),
            target_endpoint: Endpoint::new().set("db", "main"),
            store_plugin: "fs".into(),
            store_endpoint: Endpoint::new(),
            restore_key: None,
            compression: Compression::Zstd,
        }
    }

    #[test]
    fn test_lifecycle_and_terminal_guard() {
        let c = conn();
        let new = NewTask::test_store("s1", "tests");
        let t = insert(&c, &new, 100, 200).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.stopped_at, None);

        assert!(mark_running(&c, &t.uuid, 110, &snapshot()).unwrap());
        assert!(!mark_running(&c, &t.uuid, 111, &snapshot()).unwrap());

        assert!(finish(&c, &t.uuid, TaskStatus::Done, 150, "ok\n").unwrap());
        assert!(!finish(&c, &t.uuid, TaskStatus::Cancelled, 160, "late cancel\n").unwrap());

        let t = find_by_id(&c, &t.uuid).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Done);
        assert_eq!(t.started_at, Some(110));
        assert_eq!(t.stopped_at, Some(150));
        assert_eq!(t.log, "ok\n");
        assert_eq!(t.target_endpoint.get("db").and_then(|v| v.as_str()), Some("main"));
        assert_eq!(t.compression, Compression::Zstd);
    }

    #[test]
    fn test_stopped_never_precedes_started() {
        let c = conn();
        let t = insert(&c, &NewTask::test_store("s1", "tests"), 100, 200).unwrap();
        mark_running(&c, &t.uuid, 120, &snapshot()).unwrap();
        finish(&c, &t.uuid, TaskStatus::Failed, 90, "clock skew\n").unwrap();
        let t = find_by_id(&c, &t.uuid).unwrap().unwrap();
        assert_eq!(t.stopped_at, Some(120));

        let never_ran = insert(&c, &NewTask::test_store("s1", "tests"), 100, 200).unwrap();
        finish(&c, &never_ran.uuid, TaskStatus::Failed, 130, "target is gone\n").unwrap();
        let t = find_by_id(&c, &never_ran.uuid).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.started_at, Some(130));
        assert_eq!(t.stopped_at, Some(130));
    }

    #[test]
    fn test_exclusive_keys() {
        let mut new = NewTask::test_store("s1", "tests");
        assert!(new.exclusive_keys().is_empty());
        new.op = Operation::Backup;
        new.target_uuid = Some("t1".into());
        new.job_uuid = Some("j1".into());
        assert_eq!(new.exclusive_keys(), vec!["target:t1", "job:j1"]);

        let mut purge = NewTask::test_store("s1", "tests");
        purge.op = Operation::Purge;
        purge.target_uuid = Some("t1".into());
        purge.archive_uuid = Some("a1".into());
        assert_eq!(purge.exclusive_keys(), vec!["target:t1", "archive:a1"]);
    }

    #[test]
    fn test_filter_by_status() {
        let c = conn();
        let a = insert(&c, &NewTask::test_store("s1", "tests"), 100, 200).unwrap();
        insert(&c, &NewTask::test_store("s2", "tests"), 101, 200).unwrap();
        finish(&c, &a.uuid, TaskStatus::Failed, 105, "").unwrap();
        assert_eq!(find_all(&c, Some(TaskStatus::Failed), 10).unwrap().len(), 1);
        assert_eq!(find_all(&c, None, 10).unwrap().len(), 2);
        assert_eq!(find_by_status(&c, TaskStatus::Pending).unwrap().len(), 1);
    }
}
