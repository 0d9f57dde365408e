use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{error_body, store_error_response};
use crate::{db::RedeemOutcome, middleware::AuthenticatedUser, state::AppState};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRedeemCodeRequest {
    pub code: String,
    pub credits: i64,
    #[serde(default = "default_max_uses")]
    pub max_uses: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_max_uses() -> i64 {
    1
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let balance = match state.store.ledger.balance(&user.user_id) {
        Ok(balance) => balance,
        Err(error) => return store_error_response(error, "loading balance"),
    };
    match state.store.ledger.history(&user.user_id, limit) {
        Ok(transactions) => (
            StatusCode::OK,
            Json(json!({ "balance": balance, "transactions": transactions })),
        )
            .into_response(),
        Err(error) => store_error_response(error, "loading transactions"),
    }
}

pub async fn redeem_code(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<RedeemRequest>,
) -> Response {
    let Some(code) = body.code.filter(|code| !code.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "Missing redeem code.");
    };

    let outcome = match state.store.redeem.redeem(&code, &user.user_id) {
        Ok(outcome) => outcome,
        Err(error) => return store_error_response(error, "redeeming code"),
    };

    let status = match outcome {
        RedeemOutcome::Redeemed { .. } => StatusCode::OK,
        RedeemOutcome::AlreadyRedeemed => StatusCode::CONFLICT,
        RedeemOutcome::Exhausted | RedeemOutcome::Expired => StatusCode::GONE,
        RedeemOutcome::Unknown => StatusCode::NOT_FOUND,
    };
    (status, Json(outcome)).into_response()
}

/// Operator endpoint behind the admin key.
pub async fn create_redeem_code(
    State(state): State<AppState>,
    Json(body): Json<CreateRedeemCodeRequest>,
) -> Response {
    if body.code.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "Missing redeem code.");
    }

    match state
        .store
        .redeem
        .create_code(&body.code, body.credits, body.max_uses, body.expires_at)
    {
        Ok(()) => {
            tracing::info!(credits = body.credits, max_uses = body.max_uses, "redeem code created");
            (
                StatusCode::CREATED,
                Json(json!({ "code": body.code.trim().to_ascii_uppercase() })),
            )
                .into_response()
        }
        Err(error) => store_error_response(error, "creating redeem code"),
    }
}
