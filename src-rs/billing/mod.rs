//! Payment provider reconciliation.
//!
//! Stripe and Square payloads are translated into provider-neutral
//! [`BillingEvent`]s, then applied to the local profile, subscription and
//! ledger state under a per-event idempotency claim.

mod reconcile;
pub mod square_events;
pub mod stripe_events;

use chrono::{DateTime, Utc};

use crate::{
    db::ClaimOutcome,
    plans::{CreditPack, Plan},
    state::AppState,
};

pub use reconcile::apply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Stripe,
    Square,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::Square => "square",
        }
    }
}

/// Subscription state as a provider reported it at `occurred_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    /// User id carried in provider metadata, when present.
    pub user_id: Option<String>,
    /// `None` when the price is not one we sell; the stored plan is kept.
    pub plan: Option<Plan>,
    pub status: String,
    pub price_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub occurred_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    CustomerLinked {
        customer_id: String,
        user_id: String,
    },
    SubscriptionChanged(SubscriptionSnapshot),
    SubscriptionEnded(SubscriptionSnapshot),
    PeriodPaid {
        invoice_id: String,
        customer_id: Option<String>,
        subscription_id: Option<String>,
        plan: Option<Plan>,
        period_end: Option<DateTime<Utc>>,
    },
    PaymentFailed {
        invoice_id: String,
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
    CreditsPurchased {
        purchase_id: String,
        customer_id: Option<String>,
        user_id: Option<String>,
        pack: CreditPack,
    },
}

impl BillingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BillingEvent::CustomerLinked { .. } => "customer_linked",
            BillingEvent::SubscriptionChanged(_) => "subscription_changed",
            BillingEvent::SubscriptionEnded(_) => "subscription_ended",
            BillingEvent::PeriodPaid { .. } => "period_paid",
            BillingEvent::PaymentFailed { .. } => "payment_failed",
            BillingEvent::CreditsPurchased { .. } => "credits_purchased",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
}

/// Claims `(provider, event_id)`, applies every translated event and marks the
/// claim processed. A failed apply releases the claim and returns the error so
/// the provider retries the delivery.
pub async fn process_webhook(
    state: &AppState,
    provider: Provider,
    event_id: &str,
    event_type: &str,
    events: Vec<BillingEvent>,
) -> anyhow::Result<WebhookOutcome> {
    let claim = state
        .store
        .webhook_events
        .claim(provider.as_str(), event_id, event_type)?;
    if claim == ClaimOutcome::Duplicate {
        tracing::info!(
            provider = provider.as_str(),
            event_id,
            event_type,
            "duplicate webhook event ignored"
        );
        return Ok(WebhookOutcome::Duplicate);
    }

    for event in &events {
        if let Err(error) = apply(state, provider, event).await {
            tracing::error!(
                provider = provider.as_str(),
                event_id,
                event_type,
                billing_event = event.name(),
                error = ?error,
                "webhook event failed, releasing claim"
            );
            if let Err(release_error) = state
                .store
                .webhook_events
                .release(provider.as_str(), event_id)
            {
                tracing::error!(error = %release_error, event_id, "failed to release webhook claim");
            }
            return Err(error);
        }
    }

    state
        .store
        .webhook_events
        .mark_processed(provider.as_str(), event_id)?;
    tracing::info!(
        provider = provider.as_str(),
        event_id,
        event_type,
        applied = events.len(),
        "webhook event processed"
    );
    Ok(WebhookOutcome::Processed)
}
