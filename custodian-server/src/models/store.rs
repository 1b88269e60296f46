use super::{endpoint_column, new_uuid};
use custodian_plugin::Endpoint;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub uuid: String,
    pub name: String,
    pub summary: String,
    pub plugin: String,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewStore {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub plugin: String,
    #[serde(default)]
    pub endpoint: Endpoint,
}

fn row_to_store(row: &Row) -> rusqlite::Result<Store> {
    Ok(Store {
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        summary: row.get("summary")?,
        plugin: row.get("plugin")?,
        endpoint: endpoint_column(row, "endpoint")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Store>> {
    let mut stmt = conn.prepare("SELECT * FROM stores ORDER BY name")?;
    let rows = stmt.query_map([], row_to_store)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn find_by_id(conn: &Connection, uuid: &str) -> anyhow::Result<Option<Store>> {
    Ok(conn
        .query_row("SELECT * FROM stores WHERE uuid = ?", params![uuid], row_to_store)
        .optional()?)
}

pub fn create(conn: &Connection, data: &NewStore) -> anyhow::Result<Store> {
    let uuid = new_uuid();
    conn.execute(
        "INSERT INTO stores (uuid, name, summary, plugin, endpoint) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![uuid, data.name, data.summary, data.plugin, data.endpoint.to_json()],
    )?;
    find_by_id(conn, &uuid)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created store"))
}

pub fn update_endpoint(conn: &Connection, uuid: &str, endpoint: &Endpoint) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE stores SET endpoint = ?1 WHERE uuid = ?2",
        params![endpoint.to_json(), uuid],
    )?;
    Ok(changed > 0)
}

pub fn delete(conn: &Connection, uuid: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM stores WHERE uuid = ?", params![uuid])?;
    Ok(changes > 0)
}

/// A store no job references.
pub fn is_unused(conn: &Connection, uuid: &str) -> anyhow::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE store_uuid = ?",
        params![uuid],
        |r| r.get(0),
    )?;
    Ok(n == 0)
}
