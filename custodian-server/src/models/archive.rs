use super::endpoint_column;
use custodian_plugin::{Compression, Endpoint};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Valid,
    Purged,
    /// Set by operators directly in the database; nothing here assigns it.
    /// Tainted archives are never restored or purged.
    Tainted,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Valid => "valid",
            ArchiveStatus::Purged => "purged",
            ArchiveStatus::Tainted => "tainted",
        }
    }
}

impl std::str::FromStr for ArchiveStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(ArchiveStatus::Valid),
            "purged" => Ok(ArchiveStatus::Purged),
            "tainted" => Ok(ArchiveStatus::Tainted),
            other => Err(format!("unknown archive status '{other}'")),
        }
    }
}

impl ToSql for ArchiveStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ArchiveStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Why an archive was purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgeReason {
    Expired,
    /// Its target or store no longer exists.
    Unused,
    Manual,
}

impl PurgeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurgeReason::Expired => "expired",
            PurgeReason::Unused => "unused",
            PurgeReason::Manual => "manual",
        }
    }
}

impl std::str::FromStr for PurgeReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expired" => Ok(PurgeReason::Expired),
            "unused" => Ok(PurgeReason::Unused),
            "manual" => Ok(PurgeReason::Manual),
            other => Err(format!("unknown purge reason '{other}'")),
        }
    }
}

impl std::fmt::Display for PurgeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub uuid: String,
    pub job_uuid: Option<String>,
    pub target_uuid: String,
    pub store_uuid: String,
    pub store_key: String,
    pub taken_at: i64,
    pub expires_at: i64,
    pub notes: String,
    pub purge_reason: Option<String>,
    pub status: ArchiveStatus,
    pub size: i64,
    pub compression: Compression,
    pub agent: String,
    pub store_plugin: String,
    pub store_endpoint: Endpoint,
    pub purge_failures: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveFilter {
    pub target: Option<String>,
    pub store: Option<String>,
    pub status: Option<ArchiveStatus>,
    /// Only archives whose target or store has been deleted.
    #[serde(default)]
    pub unused: bool,
}

fn row_to_archive(row: &Row) -> rusqlite::Result<Archive> {
    let compression: String = row.get("compression")?;
    Ok(Archive {
        uuid: row.get("uuid")?,
        job_uuid: row.get("job_uuid")?,
        target_uuid: row.get("target_uuid")?,
        store_uuid: row.get("store_uuid")?,
        store_key: row.get("store_key")?,
        taken_at: row.get("taken_at")?,
        expires_at: row.get("expires_at")?,
        notes: row.get("notes")?,
        purge_reason: row.get("purge_reason")?,
        status: row.get("status")?,
        size: row.get("size")?,
        compression: compression
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))?,
        agent: row.get("agent")?,
        store_plugin: row.get("store_plugin")?,
        store_endpoint: endpoint_column(row, "store_endpoint")?,
        purge_failures: row.get("purge_failures")?,
    })
}

const ORPHANED: &str = "(NOT EXISTS (SELECT 1 FROM targets t WHERE t.uuid = archives.target_uuid)
     OR NOT EXISTS (SELECT 1 FROM stores s WHERE s.uuid = archives.store_uuid))";

/// Inserts a new valid archive. Callers run this inside the transaction that
/// marks the producing task `done`.
pub fn insert(conn: &Connection, archive: &Archive) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO archives (uuid, job_uuid, target_uuid, store_uuid, store_key, taken_at, expires_at, notes,
                               status, size, compression, agent, store_plugin, store_endpoint)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            archive.uuid,
            archive.job_uuid,
            archive.target_uuid,
            archive.store_uuid,
            archive.store_key,
            archive.taken_at,
            archive.expires_at,
            archive.notes,
            archive.status,
            archive.size,
            archive.compression.as_str(),
            archive.agent,
            archive.store_plugin,
            archive.store_endpoint.to_json(),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, uuid: &str) -> anyhow::Result<Option<Archive>> {
    Ok(conn
        .query_row("SELECT * FROM archives WHERE uuid = ?", params![uuid], row_to_archive)
        .optional()?)
}

pub fn find_all(conn: &Connection, filter: &ArchiveFilter) -> anyhow::Result<Vec<Archive>> {
    let mut sql = String::from(
        "SELECT * FROM archives WHERE (?1 IS NULL OR target_uuid = ?1)
           AND (?2 IS NULL OR store_uuid = ?2)
           AND (?3 IS NULL OR status = ?3)",
    );
    if filter.unused {
        sql.push_str(" AND ");
        sql.push_str(ORPHANED);
    }
    sql.push_str(" ORDER BY taken_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![filter.target, filter.store, filter.status], row_to_archive)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Valid archives due for purge: expired ones, and ones whose target or
/// store is gone. Oldest expiry first.
pub fn find_purge_candidates(conn: &Connection, now: i64) -> anyhow::Result<Vec<(Archive, PurgeReason)>> {
    let sql = format!(
        "SELECT *, CASE WHEN expires_at <= ?1 THEN 'expired' ELSE 'unused' END AS reason
         FROM archives
         WHERE status = 'valid' AND (expires_at <= ?1 OR {ORPHANED})
         ORDER BY expires_at ASC, taken_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![now], |row| {
        let reason: String = row.get("reason")?;
        let reason = if reason == "expired" { PurgeReason::Expired } else { PurgeReason::Unused };
        Ok((row_to_archive(row)?, reason))
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// `valid` to `purged`. The record itself is kept.
pub fn mark_purged(conn: &Connection, uuid: &str, reason: PurgeReason) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE archives SET status = 'purged', purge_reason = ?1 WHERE uuid = ?2 AND status = 'valid'",
        params![reason.as_str(), uuid],
    )?;
    Ok(changed == 1)
}

/// Bumps and returns the failed-purge counter.
pub fn record_purge_failure(conn: &Connection, uuid: &str) -> anyhow::Result<i64> {
    conn.execute(
        "UPDATE archives SET purge_failures = purge_failures + 1 WHERE uuid = ?",
        params![uuid],
    )?;
    Ok(conn.query_row(
        "SELECT purge_failures FROM archives WHERE uuid = ?",
        params![uuid],
        |r| r.get(0),
    )?)
}
