use crate::clock::from_ts;
use crate::error::AppError;
use crate::state::AppState;
use crate::timespec::{next_run, parse};
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/schedules/next", get(preview_next))
}

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub timespec: String,
    /// Unix seconds to compute from; defaults to now.
    pub after: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct Preview {
    pub timespec: String,
    pub next_run: DateTime<Utc>,
}

/// Parses a timespec and previews its next occurrence.
async fn preview_next(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PreviewQuery>,
) -> Result<Json<Preview>, AppError> {
    let spec = parse(&q.timespec)?;
    let after = q.after.map(from_ts).unwrap_or_else(|| state.clock.now());
    Ok(Json(Preview {
        timespec: spec.to_string(),
        next_run: next_run(&spec, after),
    }))
}
