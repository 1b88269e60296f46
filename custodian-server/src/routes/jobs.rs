use crate::db::connection::with_conn;
use crate::error::AppError;
use crate::models::job::{self, Job, JobFilter};
use crate::models::task::NewTask;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/job/{uuid}", get(get_job))
        .route("/job/{uuid}/pause", post(pause_job))
        .route("/job/{uuid}/unpause", post(unpause_job))
        .route("/job/{uuid}/run", post(run_job))
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<JobFilter>,
) -> Result<Json<Vec<Job>>, AppError> {
    let jobs = with_conn(&state.db, move |conn| job::find_all(conn, &filter)).await?;
    Ok(Json(jobs))
}

async fn load(state: &AppState, uuid: String) -> Result<Job, AppError> {
    with_conn(&state.db, move |conn| job::find_by_id(conn, &uuid))
        .await?
        .ok_or_else(|| AppError::NotFound("Job not found".into()))
}

async fn get_job(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> Result<Json<Job>, AppError> {
    Ok(Json(load(&state, uuid).await?))
}

async fn set_paused(state: &AppState, uuid: String, paused: bool) -> Result<StatusCode, AppError> {
    let changed = with_conn(&state.db, move |conn| job::set_paused(conn, &uuid, paused)).await?;
    if changed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Job not found".into()))
    }
}

async fn pause_job(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> Result<StatusCode, AppError> {
    tracing::info!(job_id = %uuid, "Pausing job");
    set_paused(&state, uuid, true).await
}

async fn unpause_job(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> Result<StatusCode, AppError> {
    tracing::info!(job_id = %uuid, "Unpausing job");
    set_paused(&state, uuid, false).await
}

/// Runs a job now, outside its schedule. Its next scheduled run is unchanged.
async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let job = load(&state, uuid).await?;
    let handle = state.engine.submit(NewTask::backup(&job, "api")).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "uuid": handle.uuid }))))
}
