pub mod archive;
pub mod job;
pub mod retention;
pub mod schedule;
pub mod store;
pub mod target;
pub mod task;

use custodian_plugin::Endpoint;
use rusqlite::types::Type;
use rusqlite::Row;

/// Reads a JSON endpoint column.
pub(crate) fn endpoint_column(row: &Row, name: &str) -> rusqlite::Result<Endpoint> {
    let raw: String = row.get(name)?;
    Endpoint::parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
    })
}

pub(crate) fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
