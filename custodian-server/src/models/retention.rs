use super::new_uuid;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retention {
    pub uuid: String,
    pub name: String,
    pub summary: String,
    /// Seconds an archive stays valid after it is taken.
    pub expiry: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRetention {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub expiry: i64,
}

fn row_to_retention(row: &Row) -> rusqlite::Result<Retention> {
    Ok(Retention {
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        summary: row.get("summary")?,
        expiry: row.get("expiry")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Retention>> {
    let mut stmt = conn.prepare("SELECT * FROM retention ORDER BY expiry")?;
    let rows = stmt.query_map([], row_to_retention)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn find_by_id(conn: &Connection, uuid: &str) -> anyhow::Result<Option<Retention>> {
    Ok(conn
        .query_row("SELECT * FROM retention WHERE uuid = ?", params![uuid], row_to_retention)
        .optional()?)
}

pub fn create(conn: &Connection, data: &NewRetention) -> anyhow::Result<Retention> {
    if data.expiry <= 0 {
        anyhow::bail!("retention expiry must be a positive number of seconds");
    }
    let uuid = new_uuid();
    conn.execute(
        "INSERT INTO retention (uuid, name, summary, expiry) VALUES (?1, ?2, ?3, ?4)",
        params![uuid, data.name, data.summary, data.expiry],
    )?;
    find_by_id(conn, &uuid)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created retention policy"))
}

/// Affects archives taken from now on; existing expiries are fixed.
pub fn update_expiry(conn: &Connection, uuid: &str, expiry: i64) -> anyhow::Result<bool> {
    if expiry <= 0 {
        anyhow::bail!("retention expiry must be a positive number of seconds");
    }
    let changed = conn.execute(
        "UPDATE retention SET expiry = ?1 WHERE uuid = ?2",
        params![expiry, uuid],
    )?;
    Ok(changed > 0)
}

/// Expiry of the policy bound to `job_uuid`, if both still exist.
pub fn expiry_for_job(conn: &Connection, job_uuid: &str) -> anyhow::Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT r.expiry FROM jobs j JOIN retention r ON r.uuid = j.retention_uuid WHERE j.uuid = ?",
            params![job_uuid],
            |r| r.get(0),
        )
        .optional()?)
}
