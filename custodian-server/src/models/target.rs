use super::{endpoint_column, new_uuid};
use custodian_plugin::Endpoint;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// A backup data source and the plugin that knows how to back it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub uuid: String,
    pub name: String,
    pub summary: String,
    pub plugin: String,
    pub endpoint: Endpoint,
    /// Agent that runs this target's plugin; empty means the default agent.
    pub agent: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTarget {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub plugin: String,
    #[serde(default)]
    pub endpoint: Endpoint,
    #[serde(default)]
    pub agent: String,
}

fn row_to_target(row: &Row) -> rusqlite::Result<Target> {
    Ok(Target {
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        summary: row.get("summary")?,
        plugin: row.get("plugin")?,
        endpoint: endpoint_column(row, "endpoint")?,
        agent: row.get("agent")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Target>> {
    let mut stmt = conn.prepare("SELECT * FROM targets ORDER BY name")?;
    let rows = stmt.query_map([], row_to_target)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn find_by_id(conn: &Connection, uuid: &str) -> anyhow::Result<Option<Target>> {
    Ok(conn
        .query_row("SELECT * FROM targets WHERE uuid = ?", params![uuid], row_to_target)
        .optional()?)
}

pub fn create(conn: &Connection, data: &NewTarget) -> anyhow::Result<Target> {
    let uuid = new_uuid();
    conn.execute(
        "INSERT INTO targets (uuid, name, summary, plugin, endpoint, agent) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![uuid, data.name, data.summary, data.plugin, data.endpoint.to_json(), data.agent],
    )?;
    find_by_id(conn, &uuid)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created target"))
}

pub fn update(conn: &Connection, uuid: &str, endpoint: &Endpoint, agent: &str) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE targets SET endpoint = ?1, agent = ?2 WHERE uuid = ?3",
        params![endpoint.to_json(), agent, uuid],
    )?;
    Ok(changed > 0)
}

pub fn delete(conn: &Connection, uuid: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM targets WHERE uuid = ?", params![uuid])?;
    Ok(changes > 0)
}
