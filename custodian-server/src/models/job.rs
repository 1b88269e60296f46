use super::new_uuid;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: String,
    pub name: String,
    pub summary: String,
    pub target_uuid: String,
    pub store_uuid: String,
    pub schedule_uuid: String,
    pub retention_uuid: String,
    /// Lower is more urgent.
    pub priority: i64,
    pub paused: bool,
    pub next_run: Option<i64>,
    pub last_run: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub target_uuid: String,
    pub store_uuid: String,
    pub schedule_uuid: String,
    pub retention_uuid: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub paused: bool,
}

fn default_priority() -> i64 {
    50
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub target: Option<String>,
    pub store: Option<String>,
    pub schedule: Option<String>,
    pub retention: Option<String>,
    pub paused: Option<bool>,
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        summary: row.get("summary")?,
        target_uuid: row.get("target_uuid")?,
        store_uuid: row.get("store_uuid")?,
        schedule_uuid: row.get("schedule_uuid")?,
        retention_uuid: row.get("retention_uuid")?,
        priority: row.get("priority")?,
        paused: row.get("paused")?,
        next_run: row.get("next_run")?,
        last_run: row.get("last_run")?,
    })
}

pub fn find_all(conn: &Connection, filter: &JobFilter) -> anyhow::Result<Vec<Job>> {
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();
    for (column, value) in [
        ("target_uuid", &filter.target),
        ("store_uuid", &filter.store),
        ("schedule_uuid", &filter.schedule),
        ("retention_uuid", &filter.retention),
    ] {
        if let Some(v) = value {
            clauses.push(format!("{column} = ?"));
            values.push(Box::new(v.clone()));
        }
    }
    if let Some(paused) = filter.paused {
        clauses.push("paused = ?".to_string());
        values.push(Box::new(paused));
    }

    let mut sql = "SELECT * FROM jobs".to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY priority, name");

    let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), row_to_job)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn find_by_id(conn: &Connection, uuid: &str) -> anyhow::Result<Option<Job>> {
    Ok(conn
        .query_row("SELECT * FROM jobs WHERE uuid = ?", params![uuid], row_to_job)
        .optional()?)
}

pub fn create(conn: &Connection, data: &NewJob) -> anyhow::Result<Job> {
    let uuid = new_uuid();
    conn.execute(
        "INSERT INTO jobs (uuid, name, summary, target_uuid, store_uuid, schedule_uuid, retention_uuid, priority, paused)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            uuid,
            data.name,
            data.summary,
            data.target_uuid,
            data.store_uuid,
            data.schedule_uuid,
            data.retention_uuid,
            data.priority,
            data.paused,
        ],
    )?;
    find_by_id(conn, &uuid)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created job"))
}

pub fn set_paused(conn: &Connection, uuid: &str, paused: bool) -> anyhow::Result<bool> {
    // Unpausing recomputes the next run from the present, not from a stale value.
    let changed = conn.execute(
        "UPDATE jobs SET paused = ?1, next_run = CASE WHEN ?1 THEN next_run ELSE NULL END WHERE uuid = ?2",
        params![paused, uuid],
    )?;
    Ok(changed > 0)
}

pub fn set_next_run(conn: &Connection, uuid: &str, next_run: i64) -> anyhow::Result<()> {
    conn.execute("UPDATE jobs SET next_run = ?1 WHERE uuid = ?2", params![next_run, uuid])?;
    Ok(())
}

/// Records a dispatch at `ran_at` and the occurrence after it.
pub fn record_run(conn: &Connection, uuid: &str, ran_at: i64, next_run: i64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE jobs SET last_run = ?1, next_run = ?2 WHERE uuid = ?3",
        params![ran_at, next_run, uuid],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, uuid: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM jobs WHERE uuid = ?", params![uuid])?;
    Ok(changes > 0)
}
