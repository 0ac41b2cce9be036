//! Health check endpoint

use axum::{extract::State, Json};
use serde_json::json;

use crate::{error::ApiResult, state::AppState};

/// Liveness/readiness probe; verifies database connectivity
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let db_ok = sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .is_ok();

    Ok(Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
