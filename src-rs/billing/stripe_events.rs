use anyhow::Context;
use chrono::{DateTime, Utc};

use super::{BillingEvent, SubscriptionSnapshot};
use crate::{
    plans::{resolve_plan, CreditPack, Plan, PriceMap, Product},
    stripe_api::{StripeCheckoutSession, StripeEvent, StripeInvoice, StripeSubscription},
};

/// Maps a verified Stripe event onto billing events. Types we do not act on
/// yield an empty list and are acknowledged by the caller.
pub fn translate(event: &StripeEvent, prices: &PriceMap) -> anyhow::Result<Vec<BillingEvent>> {
    let occurred_at = if event.created > 0 {
        event.created
    } else {
        Utc::now().timestamp()
    };

    match event.event_type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            let session: StripeCheckoutSession = serde_json::from_value(event.data.object.clone())
                .context("failed to decode checkout session")?;
            Ok(checkout_events(&session))
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            let subscription = decode_subscription(event)?;
            Ok(vec![BillingEvent::SubscriptionChanged(snapshot(
                &subscription,
                prices,
                occurred_at,
            ))])
        }
        "customer.subscription.deleted" => {
            let subscription = decode_subscription(event)?;
            Ok(vec![BillingEvent::SubscriptionEnded(snapshot(
                &subscription,
                prices,
                occurred_at,
            ))])
        }
        "invoice.paid" | "invoice.payment_succeeded" => {
            let invoice = decode_invoice(event)?;
            let Some(subscription) = invoice.subscription.as_ref() else {
                // One-off invoices are covered by checkout.session.completed.
                return Ok(Vec::new());
            };
            let plan = match prices.product_for_stripe_price(invoice.price_id()) {
                Some(Product::Plan(plan)) => Some(plan),
                _ => None,
            };
            Ok(vec![BillingEvent::PeriodPaid {
                invoice_id: invoice.id.clone(),
                customer_id: invoice.customer.as_ref().map(|c| c.id().to_string()),
                subscription_id: Some(subscription.id().to_string()),
                plan,
                period_end: invoice.service_period_end().and_then(from_unix),
            }])
        }
        "invoice.payment_failed" => {
            let invoice = decode_invoice(event)?;
            Ok(vec![BillingEvent::PaymentFailed {
                invoice_id: invoice.id.clone(),
                customer_id: invoice.customer.as_ref().map(|c| c.id().to_string()),
                subscription_id: invoice.subscription.as_ref().map(|s| s.id().to_string()),
            }])
        }
        other => {
            tracing::debug!(event_type = other, "unhandled Stripe event type");
            Ok(Vec::new())
        }
    }
}

fn checkout_events(session: &StripeCheckoutSession) -> Vec<BillingEvent> {
    let user_id = session
        .client_reference_id
        .clone()
        .or_else(|| session.metadata.get("userId").cloned())
        .filter(|value| !value.trim().is_empty());
    let customer_id = session.customer.as_ref().map(|c| c.id().to_string());

    let mut events = Vec::new();
    if let (Some(customer_id), Some(user_id)) = (customer_id.clone(), user_id.clone()) {
        events.push(BillingEvent::CustomerLinked {
            customer_id,
            user_id,
        });
    }

    let paid = session.payment_status.as_deref() == Some("paid");
    if session.mode.as_deref() == Some("payment") && paid {
        match session.metadata.get("pack").and_then(|raw| CreditPack::parse(raw)) {
            Some(pack) => events.push(BillingEvent::CreditsPurchased {
                purchase_id: session.id.clone(),
                customer_id,
                user_id,
                pack,
            }),
            None => {
                tracing::warn!(session_id = %session.id, "paid checkout session has no credit pack metadata");
            }
        }
    }

    events
}

pub(crate) fn snapshot(
    subscription: &StripeSubscription,
    prices: &PriceMap,
    occurred_at: i64,
) -> SubscriptionSnapshot {
    let plan = match prices.product_for_stripe_price(subscription.price_id()) {
        Some(Product::Plan(plan)) => Some(plan),
        Some(Product::Credits(_)) => None,
        None => subscription
            .metadata
            .get("plan")
            .map(|raw| resolve_plan(Some(raw)))
            .filter(|plan| *plan == Plan::Pro),
    };

    SubscriptionSnapshot {
        subscription_id: subscription.id.clone(),
        customer_id: Some(subscription.customer.id().to_string()),
        user_id: subscription.metadata.get("userId").cloned(),
        plan,
        status: subscription.status.clone(),
        price_id: subscription.price_id().map(str::to_string),
        current_period_end: subscription.period_end().and_then(from_unix),
        cancel_at_period_end: subscription.cancel_at_period_end,
        occurred_at,
    }
}

fn decode_subscription(event: &StripeEvent) -> anyhow::Result<StripeSubscription> {
    serde_json::from_value(event.data.object.clone()).context("failed to decode subscription object")
}

fn decode_invoice(event: &StripeEvent) -> anyhow::Result<StripeInvoice> {
    serde_json::from_value(event.data.object.clone()).context("failed to decode invoice object")
}

fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}
