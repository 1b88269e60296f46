use crate::db::connection::DbPool;

// Catalog rows are referenced by uuid without foreign keys: tasks and
// archives keep their own snapshot and outlive the jobs, targets and stores
// they were created from.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS targets (
  uuid TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  plugin TEXT NOT NULL,
  endpoint TEXT NOT NULL DEFAULT '{}',
  agent TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS stores (
  uuid TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  plugin TEXT NOT NULL,
  endpoint TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS schedules (
  uuid TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  timespec TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS retention (
  uuid TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  expiry INTEGER NOT NULL CHECK(expiry > 0)
);

CREATE TABLE IF NOT EXISTS jobs (
  uuid TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  target_uuid TEXT NOT NULL,
  store_uuid TEXT NOT NULL,
  schedule_uuid TEXT NOT NULL,
  retention_uuid TEXT NOT NULL,
  priority INTEGER NOT NULL DEFAULT 50,
  paused INTEGER NOT NULL DEFAULT 0,
  next_run INTEGER,
  last_run INTEGER
);

CREATE TABLE IF NOT EXISTS tasks (
  uuid TEXT PRIMARY KEY,
  owner TEXT NOT NULL DEFAULT 'system',
  op TEXT NOT NULL CHECK(op IN ('backup','restore','purge','test-store')),
  job_uuid TEXT,
  archive_uuid TEXT,
  target_uuid TEXT,
  store_uuid TEXT,
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','done','failed','cancelled')),
  requested_at INTEGER NOT NULL,
  started_at INTEGER,
  stopped_at INTEGER,
  timeout_at INTEGER NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  agent TEXT NOT NULL DEFAULT '',
  target_plugin TEXT NOT NULL DEFAULT '',
  target_endpoint TEXT NOT NULL DEFAULT '{}',
  store_plugin TEXT NOT NULL DEFAULT '',
  store_endpoint TEXT NOT NULL DEFAULT '{}',
  restore_key TEXT,
  compression TEXT NOT NULL DEFAULT 'none',
  purge_reason TEXT,
  log TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS archives (
  uuid TEXT PRIMARY KEY,
  job_uuid TEXT,
  target_uuid TEXT NOT NULL,
  store_uuid TEXT NOT NULL,
  store_key TEXT NOT NULL,
  taken_at INTEGER NOT NULL,
  expires_at INTEGER NOT NULL,
  notes TEXT NOT NULL DEFAULT '',
  purge_reason TEXT,
  status TEXT NOT NULL DEFAULT 'valid' CHECK(status IN ('valid','purged','tainted')),
  size INTEGER NOT NULL DEFAULT 0,
  compression TEXT NOT NULL DEFAULT 'none',
  agent TEXT NOT NULL DEFAULT '',
  store_plugin TEXT NOT NULL DEFAULT '',
  store_endpoint TEXT NOT NULL DEFAULT '{}',
  purge_failures INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_archives_status_expiry ON archives(status, expires_at);
"#;

/// Creates any missing tables and indexes. Safe to run repeatedly.
pub fn apply_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");
    let conn = pool.get()?;
    apply_schema(&conn)?;
    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
