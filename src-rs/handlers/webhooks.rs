use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::error_body;
use crate::{
    billing::{process_webhook, square_events, stripe_events, BillingEvent, Provider, WebhookOutcome},
    square::{SquareEvent, SIGNATURE_HEADER},
    state::AppState,
    stripe_api::{SignatureError, StripeEvent},
};

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = signature_header(&headers, STRIPE_SIGNATURE_HEADER) else {
        return error_body(StatusCode::BAD_REQUEST, "Missing Stripe signature.");
    };
    if let Err(error) = state.stripe.verify_webhook_signature(signature, &body) {
        return signature_rejection(Provider::Stripe, error);
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::error!(error = %error, "invalid Stripe webhook payload");
            return error_body(StatusCode::BAD_REQUEST, "Invalid webhook payload.");
        }
    };

    let translated = stripe_events::translate(&event, &state.price_map);
    dispatch(&state, Provider::Stripe, &event.id, &event.event_type, translated).await
}

pub async fn handle_square_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = signature_header(&headers, SIGNATURE_HEADER) else {
        return error_body(StatusCode::BAD_REQUEST, "Missing Square signature.");
    };
    if let Err(error) = state.square.verify_webhook_signature(signature, &body) {
        return signature_rejection(Provider::Square, error);
    }

    let event: SquareEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::error!(error = %error, "invalid Square webhook payload");
            return error_body(StatusCode::BAD_REQUEST, "Invalid webhook payload.");
        }
    };

    let translated = square_events::translate(&event, &state.price_map);
    dispatch(&state, Provider::Square, &event.event_id, &event.event_type, translated).await
}

fn signature_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn signature_rejection(provider: Provider, error: SignatureError) -> Response {
    match error {
        SignatureError::NotConfigured => {
            tracing::error!(provider = provider.as_str(), "webhook secret is not configured");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Webhook not configured.")
        }
        SignatureError::Invalid(reason) => {
            tracing::warn!(provider = provider.as_str(), reason, "webhook signature rejected");
            error_body(StatusCode::BAD_REQUEST, "Invalid signature.")
        }
    }
}

async fn dispatch(
    state: &AppState,
    provider: Provider,
    event_id: &str,
    event_type: &str,
    translated: anyhow::Result<Vec<BillingEvent>>,
) -> Response {
    let events = match translated {
        Ok(events) => events,
        // A signed payload that does not decode will not decode on retry either.
        Err(error) => {
            tracing::error!(provider = provider.as_str(), event_id, event_type, error = ?error, "undecodable webhook object acknowledged");
            return (
                StatusCode::OK,
                Json(json!({ "received": true, "ignored": true })),
            )
                .into_response();
        }
    };

    match process_webhook(state, provider, event_id, event_type, events).await {
        Ok(WebhookOutcome::Processed) => {
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Ok(WebhookOutcome::Duplicate) => (
            StatusCode::OK,
            Json(json!({ "received": true, "duplicate": true })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(provider = provider.as_str(), event_id, error = ?error, "webhook handling failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Webhook handler failed.")
        }
    }
}
