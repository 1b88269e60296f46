use super::new_uuid;
use crate::timespec::{self, ScheduleSyntaxError, Spec};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub uuid: String,
    pub name: String,
    pub summary: String,
    pub timespec: String,
}

impl Schedule {
    pub fn spec(&self) -> Result<Spec, ScheduleSyntaxError> {
        timespec::parse(&self.timespec)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub timespec: String,
}

fn row_to_schedule(row: &Row) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        summary: row.get("summary")?,
        timespec: row.get("timespec")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Schedule>> {
    let mut stmt = conn.prepare("SELECT * FROM schedules ORDER BY name")?;
    let rows = stmt.query_map([], row_to_schedule)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn find_by_id(conn: &Connection, uuid: &str) -> anyhow::Result<Option<Schedule>> {
    Ok(conn
        .query_row("SELECT * FROM schedules WHERE uuid = ?", params![uuid], row_to_schedule)
        .optional()?)
}

/// Rejects unparseable timespecs before anything is written.
pub fn create(conn: &Connection, data: &NewSchedule) -> anyhow::Result<Schedule> {
    timespec::parse(&data.timespec)?;
    let uuid = new_uuid();
    conn.execute(
        "INSERT INTO schedules (uuid, name, summary, timespec) VALUES (?1, ?2, ?3, ?4)",
        params![uuid, data.name, data.summary, data.timespec],
    )?;
    find_by_id(conn, &uuid)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created schedule"))
}

/// Changing the timespec clears `next_run` on every job using it so the
/// scheduler recomputes it.
pub fn update_timespec(conn: &mut Connection, uuid: &str, text: &str) -> anyhow::Result<bool> {
    timespec::parse(text)?;
    let tx = conn.transaction()?;
    let changed = tx.execute("UPDATE schedules SET timespec = ?1 WHERE uuid = ?2", params![text, uuid])?;
    tx.execute("UPDATE jobs SET next_run = NULL WHERE schedule_uuid = ?", params![uuid])?;
    tx.commit()?;
    Ok(changed > 0)
}
