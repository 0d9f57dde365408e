use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::{accounts, error::Error, state::AppState};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
}

/// Caller of the public API, identified by one of their API keys.
#[derive(Debug, Clone)]
pub struct ApiKeyUser {
    pub user_id: String,
    pub key_id: String,
    /// The raw key, forwarded to the backend on the caller's behalf.
    pub api_key: String,
}

/// Verifies the session token, upserts the user and makes sure the profile
/// (and, best-effort, the backend account) exists.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    };

    let claims = match state.auth.verify_bearer_token(auth_header) {
        Ok(claims) => claims,
        Err(error) => {
            tracing::warn!(error = %error, "authorization failed");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let user = match state
        .store
        .users
        .upsert(&claims.sub, &claims.email, claims.name.as_deref())
    {
        Ok(user) => user,
        Err(Error::Conflict(message)) => {
            tracing::warn!(user_id = %claims.sub, %message, "session email conflicts with another user");
            return (StatusCode::CONFLICT, "Email is already linked to another account.")
                .into_response();
        }
        Err(error) => {
            tracing::error!(user_id = %claims.sub, error = %error, "failed to upsert user");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    let profile = match accounts::ensure_profile(&state, &user.id) {
        Ok(profile) => profile,
        Err(error) => {
            tracing::error!(user_id = %user.id, error = %error, "failed to ensure user profile");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    if profile.backend_account_id().is_none() && state.config.backend_admin_key.is_some() {
        accounts::ensure_backend_account(&state, &user, &profile).await;
    }

    request.extensions_mut().insert(AuthenticatedUser {
        user_id: user.id,
        email: user.email,
        name: user.name,
    });

    next.run(request).await
}

pub async fn api_key_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let api_key = match request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
    {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                "Unauthorized: API Key is required.",
            )
                .into_response()
        }
    };

    let record = match state.store.api_keys.authenticate(&api_key) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, "Unauthorized: Invalid API Key.").into_response()
        }
        Err(error) => {
            tracing::error!(error = %error, "API key authentication failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    request.extensions_mut().insert(ApiKeyUser {
        user_id: record.user_id,
        key_id: record.id,
        api_key,
    });

    next.run(request).await
}

/// Guards operator endpoints. Without `ADMIN_API_KEY` they are closed.
pub async fn require_admin_key(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    let provided = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        tracing::warn!("rejected admin request with invalid key");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(request).await
}

pub async fn api_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let socket_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|value| value.0);
    let key = client_identity(request.headers(), socket_addr, state.config.trust_proxy);

    if !state.api_limiter.check_and_count(&key) {
        tracing::warn!(client = %key, "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "Too many requests from this IP, please try again after 15 minutes",
        )
            .into_response();
    }

    next.run(request).await
}

fn client_identity(
    headers: &HeaderMap,
    socket_addr: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(candidate) = forwarded {
            return candidate.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(candidate) = real_ip {
            return candidate.to_string();
        }
    }

    socket_addr
        .map(|address| address.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
