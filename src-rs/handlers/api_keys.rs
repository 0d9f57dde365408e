use axum::{
    body::Bytes,
    extract::{Extension, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use super::{error_body, require_backend_account, store_error_response};
use crate::{middleware::AuthenticatedUser, state::AppState};

const MAX_ACTIVE_KEYS: usize = 10;
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Default, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: Option<String>,
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    match state.store.api_keys.list_active(&user.user_id) {
        Ok(keys) => (StatusCode::OK, Json(json!({ "keys": keys }))).into_response(),
        Err(error) => store_error_response(error, "listing API keys"),
    }
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Bytes,
) -> Response {
    let request: CreateApiKeyRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateApiKeyRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(_) => return error_body(StatusCode::BAD_REQUEST, "Invalid JSON body."),
        }
    };
    let name = request
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Default".to_string());
    if name.chars().count() > MAX_NAME_LEN {
        return error_body(StatusCode::BAD_REQUEST, "API key name is too long.");
    }

    match state.store.api_keys.list_active(&user.user_id) {
        Ok(keys) if keys.len() >= MAX_ACTIVE_KEYS => {
            return error_body(
                StatusCode::BAD_REQUEST,
                format!("At most {MAX_ACTIVE_KEYS} active API keys are allowed."),
            )
        }
        Ok(_) => {}
        Err(error) => return store_error_response(error, "listing API keys"),
    }

    let account_id = match require_backend_account(&state, &user.user_id).await {
        Ok(account_id) => account_id,
        Err(response) => return response,
    };

    let issued = match state.backend.issue_api_key(&account_id, &name).await {
        Ok(issued) => issued,
        Err(error) => {
            tracing::error!(user_id = %user.user_id, error = ?error, "backend failed to issue API key");
            return error_body(StatusCode::BAD_GATEWAY, "Error generating API key");
        }
    };

    match state
        .store
        .api_keys
        .create(&user.user_id, &name, &issued.key, Some(&issued.id))
    {
        Ok(record) => {
            tracing::info!(user_id = %user.user_id, key_id = %record.id, "API key issued");
            (
                StatusCode::CREATED,
                Json(json!({ "apiKey": issued.key, "key": record })),
            )
                .into_response()
        }
        Err(error) => {
            // Keep the backend in step with what we could not store.
            if let Err(revoke_error) = state.backend.revoke_api_key(&account_id, &issued.id).await {
                tracing::warn!(error = %revoke_error, "failed to revoke unstored backend key");
            }
            store_error_response(error, "storing API key")
        }
    }
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Response {
    if id.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "Missing API key ID.");
    }

    let record = match state.store.api_keys.revoke(&user.user_id, &id) {
        Ok(Some(record)) => record,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "API key not found."),
        Err(error) => return store_error_response(error, "deleting API key"),
    };

    let account_id = state
        .store
        .profiles
        .find(&user.user_id)
        .ok()
        .flatten()
        .and_then(|profile| profile.backend_account_id().map(str::to_string));
    if let (Some(account_id), Some(backend_key_id)) = (account_id, record.backend_key_id.as_deref()) {
        if let Err(error) = state
            .backend
            .revoke_api_key(&account_id, backend_key_id)
            .await
        {
            tracing::warn!(user_id = %user.user_id, key_id = %record.id, error = %error, "backend key revocation failed");
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "message": "API key deleted successfully." })),
    )
        .into_response()
}
