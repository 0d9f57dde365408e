use axum::{
    extract::{Extension, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use super::{error_body, store_error_response};
use crate::{
    billing::Provider,
    middleware::AuthenticatedUser,
    plans::{resolve_plan, BillingInterval, CreditPack, Plan},
    state::AppState,
    stripe_api::CheckoutMode,
};

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub plan: Option<String>,
    pub pack: Option<String>,
    #[serde(default)]
    pub interval: Option<BillingInterval>,
}

enum Purchase {
    Subscription(Plan, BillingInterval),
    Credits(CreditPack),
}

impl CreateCheckoutRequest {
    fn purchase(&self) -> Result<Purchase, &'static str> {
        match (self.plan.as_deref(), self.pack.as_deref()) {
            (Some(_), Some(_)) => Err("Provide either a plan or a credit pack, not both."),
            (Some(plan), None) => match resolve_plan(Some(plan)) {
                Plan::Pro => Ok(Purchase::Subscription(
                    Plan::Pro,
                    self.interval.unwrap_or(BillingInterval::Month),
                )),
                Plan::Free => Err("The free plan cannot be purchased."),
            },
            (None, Some(pack)) => CreditPack::parse(pack)
                .map(Purchase::Credits)
                .ok_or("Unknown credit pack."),
            (None, None) => Err("Missing required parameter: plan or pack."),
        }
    }
}

pub async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<CreateCheckoutRequest>,
) -> Response {
    if !state.stripe.is_configured() {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "Billing is not configured.");
    }

    let purchase = match body.purchase() {
        Ok(purchase) => purchase,
        Err(message) => return error_body(StatusCode::BAD_REQUEST, message),
    };

    let (price_id, mode) = match &purchase {
        Purchase::Subscription(plan, interval) => (
            state.price_map.stripe_price_for_plan(*plan, *interval),
            CheckoutMode::Subscription { plan: plan.as_str() },
        ),
        Purchase::Credits(pack) => (
            state.price_map.stripe_price_for_pack(*pack),
            CheckoutMode::Payment { pack: pack.as_str() },
        ),
    };
    let Some(price_id) = price_id else {
        return error_body(
            StatusCode::BAD_REQUEST,
            "This product is not available for purchase.",
        );
    };

    let customer_id = match stripe_customer_for(&state, &user).await {
        Ok(customer_id) => customer_id,
        Err(response) => return response,
    };

    let frontend = frontend_base(&state);
    let success_url = format!("{frontend}/billing?checkout=success");
    let cancel_url = format!("{frontend}/billing?checkout=cancelled");

    let session = match state
        .stripe
        .create_checkout_session(
            &customer_id,
            &user.user_id,
            price_id,
            mode,
            &success_url,
            &cancel_url,
        )
        .await
    {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(user_id = %user.user_id, error = ?error, "failed to create Stripe checkout session");
            return error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error creating checkout session",
            );
        }
    };

    match session.url {
        Some(url) => (StatusCode::OK, Json(json!({ "url": url }))).into_response(),
        None => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error creating Stripe checkout session.",
        ),
    }
}

pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    if !state.stripe.is_configured() {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "Billing is not configured.");
    }

    let customer_id = match state
        .store
        .customers
        .customer_for_user(Provider::Stripe.as_str(), &user.user_id)
    {
        Ok(Some(customer_id)) => customer_id,
        Ok(None) => return error_body(StatusCode::BAD_REQUEST, "Stripe customer not found."),
        Err(error) => return store_error_response(error, "loading Stripe customer"),
    };

    let return_url = format!("{}/billing", frontend_base(&state));
    let session = match state
        .stripe
        .create_billing_portal_session(&customer_id, &return_url)
        .await
    {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(user_id = %user.user_id, error = ?error, "failed to create Stripe portal session");
            return error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error creating customer portal session",
            );
        }
    };

    match session.url {
        Some(url) => (StatusCode::OK, Json(json!({ "url": url }))).into_response(),
        None => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error creating Stripe customer portal session.",
        ),
    }
}

/// The caller's Stripe customer, created and linked on first checkout.
async fn stripe_customer_for(
    state: &AppState,
    user: &AuthenticatedUser,
) -> Result<String, Response> {
    let provider = Provider::Stripe.as_str();
    match state.store.customers.customer_for_user(provider, &user.user_id) {
        Ok(Some(customer_id)) => return Ok(customer_id),
        Ok(None) => {}
        Err(error) => return Err(store_error_response(error, "loading Stripe customer")),
    }

    let customer = state
        .stripe
        .create_customer(&user.email, &user.user_id)
        .await
        .map_err(|error| {
            tracing::error!(user_id = %user.user_id, error = ?error, "failed to create Stripe customer");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error creating checkout session",
            )
        })?;

    state
        .store
        .customers
        .link(provider, &customer.id, &user.user_id)
        .map_err(|error| store_error_response(error, "saving Stripe customer"))?;
    tracing::info!(user_id = %user.user_id, customer_id = %customer.id, "created Stripe customer");
    Ok(customer.id)
}

fn frontend_base(state: &AppState) -> String {
    state
        .config
        .frontend_url
        .as_deref()
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_string()
}
