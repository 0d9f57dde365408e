//! HTTP handlers, grouped by surface.

pub mod api_keys;
pub mod billing;
pub mod credits;
pub mod generation;
pub mod health;
pub mod profile;
pub mod status;
pub mod webhooks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::{accounts, error::Error, state::AppState};

static TASK_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid regex"));

/// Task ids are interpolated into backend URLs, so only plain identifiers pass.
pub(crate) fn is_valid_task_id(task_id: &str) -> bool {
    TASK_ID.is_match(task_id)
}

pub(crate) fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Maps store errors onto HTTP statuses; unexpected ones are logged.
pub(crate) fn store_error_response(error: Error, action: &str) -> Response {
    match error {
        Error::InsufficientCredits { balance, required } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": "Insufficient credits",
                "balance": balance,
                "required": required,
            })),
        )
            .into_response(),
        Error::NotFound(message) => error_body(StatusCode::NOT_FOUND, message),
        Error::InvalidInput(message) => error_body(StatusCode::BAD_REQUEST, message),
        Error::Conflict(message) => error_body(StatusCode::CONFLICT, message),
        Error::Database(message) => {
            tracing::error!(error = %message, action, "database error");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("Error {action}"))
        }
    }
}

/// The caller's backend account id, created on demand. Errors are ready-made
/// responses.
pub(crate) async fn require_backend_account(
    state: &AppState,
    user_id: &str,
) -> Result<String, Response> {
    let profile = state
        .store
        .profiles
        .get(user_id)
        .map_err(|error| store_error_response(error, "loading profile"))?;
    if let Some(account_id) = profile.backend_account_id() {
        return Ok(account_id.to_string());
    }

    let user = state
        .store
        .users
        .find(user_id)
        .map_err(|error| store_error_response(error, "loading user"))?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "User not found."))?;

    accounts::ensure_backend_account(state, &user, &profile)
        .await
        .ok_or_else(|| {
            error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                "Generation backend account is not available. Please try again later.",
            )
        })
}

pub async fn not_found() -> Response {
    error_body(StatusCode::NOT_FOUND, "Not Found")
}
