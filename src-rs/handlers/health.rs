use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Response {
    let database = match state.store.ping() {
        Ok(()) => None,
        Err(error) => {
            tracing::error!(error = %error, "database health check failed");
            Some(error.to_string())
        }
    };

    let backend = match state.backend.health().await {
        Ok(()) => None,
        Err(error) => {
            tracing::error!(error = ?error, backend_url = %state.backend.base_url(), "backend health check failed");
            Some(error.to_string())
        }
    };

    let healthy = database.is_none() && backend.is_none();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "database": database.unwrap_or_else(|| "ok".to_string()),
            "backend": backend.unwrap_or_else(|| "ok".to_string()),
        })),
    )
        .into_response()
}
