pub mod accounts;
pub mod auth;
pub mod backend;
pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod plans;
pub mod rate_limit;
mod serde_num;
pub mod square;
pub mod state;
pub mod stripe_api;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

const BODY_LIMIT: usize = 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let session_router = Router::new()
        .route("/profile", get(handlers::profile::get_profile))
        .route(
            "/profile/preferences",
            patch(handlers::profile::update_preferences),
        )
        .route(
            "/credits/transactions",
            get(handlers::credits::list_transactions),
        )
        .route("/credits/redeem", post(handlers::credits::redeem_code))
        .route(
            "/keys",
            get(handlers::api_keys::list_api_keys).post(handlers::api_keys::create_api_key),
        )
        .route("/keys/{id}", delete(handlers::api_keys::delete_api_key))
        .route("/generate/imagine", post(handlers::generation::imagine))
        .route("/generate/upscale", post(handlers::generation::upscale))
        .route("/tasks", get(handlers::generation::list_tasks))
        .route("/tasks/{task_id}", get(handlers::generation::get_task))
        .route(
            "/billing/checkout",
            post(handlers::billing::create_checkout_session),
        )
        .route(
            "/billing/portal",
            post(handlers::billing::create_portal_session),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_session,
        ));

    let public_api_router = Router::new()
        .route("/v1/status/{task_id}", get(handlers::status::task_status))
        .route(
            "/v1/status/{task_id}/stream",
            get(handlers::status::task_status_stream),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::api_key_auth,
        ));

    let admin_router = Router::new()
        .route(
            "/admin/redeem-codes",
            post(handlers::credits::create_redeem_code),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_admin_key,
        ));

    let api_router = Router::new()
        .merge(session_router)
        .merge(public_api_router)
        .merge(admin_router)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::api_rate_limit,
        ));

    let webhook_router = Router::new()
        .route(
            "/api/webhook/stripe",
            post(handlers::webhooks::handle_stripe_webhook),
        )
        .route(
            "/api/webhooks/stripe",
            post(handlers::webhooks::handle_stripe_webhook),
        )
        .route(
            "/api/stripe/webhooks",
            post(handlers::webhooks::handle_stripe_webhook),
        )
        .route(
            "/api/webhooks/square",
            post(handlers::webhooks::handle_square_webhook),
        );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health::health))
        .merge(webhook_router)
        .nest("/api", api_router)
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
