use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::store;
use crate::models::task::NewTask;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/store/{uuid}/test", post(test_store))
}

/// Round-trips a probe object through the store as a `test-store` task.
async fn test_store(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let id = uuid.clone();
    let found = with_conn(&state.db, move |conn| store::find_by_id(conn, &id)).await?;
    if found.is_none() {
        return Err(AppError::NotFound("Store not found".into()));
    }
    let handle = state.engine.submit(NewTask::test_store(&uuid, "api")).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "uuid": handle.uuid }))))
}
