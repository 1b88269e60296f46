use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::task::{self, Task, TaskStatus};
use crate::routes::flag;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const REDACT_OPEN: &str = "<redacted>";
const REDACT_CLOSE: &str = "</redacted>";
const REDACTED: &str = "«REDACTED»";
const DEFAULT_LIMIT: i64 = 100;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/task/{uuid}", get(get_task).delete(cancel_task))
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub debug: Option<String>,
}

/// Masks every `<redacted>…</redacted>` span. An unterminated marker masks
/// the rest of the text.
pub fn redact_log(log: &str) -> String {
    let mut out = String::with_capacity(log.len());
    let mut rest = log;
    while let Some(start) = rest.find(REDACT_OPEN) {
        out.push_str(&rest[..start]);
        out.push_str(REDACTED);
        let after = &rest[start + REDACT_OPEN.len()..];
        match after.find(REDACT_CLOSE) {
            Some(end) => rest = &after[end + REDACT_CLOSE.len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn present(mut t: Task, debug: bool) -> Task {
    if !debug {
        t.log = redact_log(&t.log);
    }
    t
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TaskQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let status = match q.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(s.parse::<TaskStatus>().map_err(AppError::BadRequest)?),
    };
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 10_000);
    let debug = flag(&q.debug);
    let tasks = with_conn(&state.db, move |conn| task::find_all(conn, status, limit)).await?;
    Ok(Json(tasks.into_iter().map(|t| present(t, debug)).collect()))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Query(q): Query<TaskQuery>,
) -> Result<Json<Task>, AppError> {
    let found = with_conn(&state.db, move |conn| task::find_by_id(conn, &uuid)).await?;
    let t = found.ok_or_else(|| AppError::NotFound("Task not found".into()))?;
    Ok(Json(present(t, flag(&q.debug))))
}

/// Cancels a task; repeating the call returns the same terminal status.
async fn cancel_task(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> Result<Json<Value>, AppError> {
    let status = state.engine.cancel(&uuid).await?;
    Ok(Json(json!({ "uuid": uuid, "status": status })))
}
