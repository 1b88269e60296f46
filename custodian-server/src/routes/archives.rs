use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::archive::{self, Archive, ArchiveFilter, ArchiveStatus, PurgeReason};
use crate::models::task::NewTask;
use crate::routes::flag;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/archives", get(list_archives))
        .route("/archive/{uuid}", get(get_archive).delete(purge_archive))
        .route("/archive/{uuid}/restore", post(restore_archive))
}

#[derive(Debug, Default, Deserialize)]
pub struct ArchiveQuery {
    pub target: Option<String>,
    pub store: Option<String>,
    pub status: Option<String>,
    pub unused: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    /// Restore into this target instead of the one the archive came from.
    pub target: Option<String>,
}

async fn list_archives(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ArchiveQuery>,
) -> Result<Json<Vec<Archive>>, AppError> {
    let status = match q.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(s.parse::<ArchiveStatus>().map_err(AppError::BadRequest)?),
    };
    let filter = ArchiveFilter {
        target: q.target,
        store: q.store,
        status,
        unused: flag(&q.unused),
    };
    let archives = with_conn(&state.db, move |conn| archive::find_all(conn, &filter)).await?;
    Ok(Json(archives))
}

async fn load(state: &AppState, uuid: String) -> Result<Archive, AppError> {
    with_conn(&state.db, move |conn| archive::find_by_id(conn, &uuid))
        .await?
        .ok_or_else(|| AppError::NotFound("Archive not found".into()))
}

async fn get_archive(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> Result<Json<Archive>, AppError> {
    Ok(Json(load(&state, uuid).await?))
}

async fn restore_archive(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    body: Option<Json<RestoreRequest>>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let record = load(&state, uuid).await?;
    if record.status != ArchiveStatus::Valid {
        return Err(AppError::Unprocessable(format!(
            "archive is {}, only valid archives can be restored",
            record.status.as_str()
        )));
    }
    let target = body.and_then(|Json(b)| b.target);
    let handle = state
        .engine
        .submit(NewTask::restore(&record, target.as_deref(), "api"))
        .await?;
    tracing::info!(archive_id = %record.uuid, task_id = %handle.uuid, "Restore requested");
    Ok((StatusCode::ACCEPTED, Json(json!({ "uuid": handle.uuid }))))
}

/// Manual purge. The archive record stays, marked `purged`, once the purge task succeeds.
async fn purge_archive(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let handle = state.retention.purge(&uuid, PurgeReason::Manual, "api").await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "uuid": handle.uuid }))))
}
