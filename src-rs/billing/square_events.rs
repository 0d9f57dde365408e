use anyhow::Context;

use super::{BillingEvent, SubscriptionSnapshot};
use crate::{
    plans::{CreditPack, PriceMap},
    square::{SquareEvent, SquareInvoice, SquarePayment, SquareSubscription},
};

/// Maps a verified Square event onto billing events.
///
/// Payments carry our purchase context in `reference_id` as `<pack>` or
/// `<pack>:<user id>`; the user part also links the Square customer.
pub fn translate(event: &SquareEvent, prices: &PriceMap) -> anyhow::Result<Vec<BillingEvent>> {
    match event.event_type.as_str() {
        "payment.created" | "payment.updated" => {
            let payment: SquarePayment = decode(event, "payment")?;
            Ok(payment_events(&payment))
        }
        "subscription.created" | "subscription.updated" => {
            let subscription: SquareSubscription = decode(event, "subscription")?;
            let snapshot = SubscriptionSnapshot {
                subscription_id: subscription.id.clone(),
                customer_id: subscription.customer_id.clone(),
                user_id: None,
                plan: prices.plan_for_square_variation(subscription.variation_id()),
                status: subscription.status.to_ascii_lowercase(),
                price_id: subscription.variation_id().map(str::to_string),
                current_period_end: subscription.charged_through(),
                cancel_at_period_end: subscription.canceled_date.is_some()
                    && !subscription.is_ended(),
                occurred_at: event.occurred_at(),
            };
            Ok(vec![if subscription.is_ended() {
                BillingEvent::SubscriptionEnded(snapshot)
            } else {
                BillingEvent::SubscriptionChanged(snapshot)
            }])
        }
        "invoice.payment_made" => {
            let invoice: SquareInvoice = decode(event, "invoice")?;
            let Some(subscription_id) = invoice.subscription_id.clone() else {
                return Ok(Vec::new());
            };
            Ok(vec![BillingEvent::PeriodPaid {
                invoice_id: invoice.id.clone(),
                customer_id: invoice
                    .primary_recipient
                    .as_ref()
                    .and_then(|recipient| recipient.customer_id.clone()),
                subscription_id: Some(subscription_id),
                plan: None,
                period_end: None,
            }])
        }
        "invoice.scheduled_charge_failed" => {
            let invoice: SquareInvoice = decode(event, "invoice")?;
            Ok(vec![BillingEvent::PaymentFailed {
                invoice_id: invoice.id.clone(),
                customer_id: invoice
                    .primary_recipient
                    .as_ref()
                    .and_then(|recipient| recipient.customer_id.clone()),
                subscription_id: invoice.subscription_id.clone(),
            }])
        }
        other => {
            tracing::debug!(event_type = other, "unhandled Square event type");
            Ok(Vec::new())
        }
    }
}

fn payment_events(payment: &SquarePayment) -> Vec<BillingEvent> {
    if !payment.status.eq_ignore_ascii_case("COMPLETED") {
        return Vec::new();
    }
    let Some(reference) = payment.reference_id.as_deref() else {
        return Vec::new();
    };

    let (pack_part, user_id) = match reference.split_once(':') {
        Some((pack, user)) if !user.trim().is_empty() => (pack, Some(user.trim().to_string())),
        _ => (reference, None),
    };

    let mut events = Vec::new();
    if let (Some(customer_id), Some(user_id)) = (payment.customer_id.clone(), user_id.clone()) {
        events.push(BillingEvent::CustomerLinked {
            customer_id,
            user_id,
        });
    }
    if let Some(pack) = CreditPack::parse(pack_part) {
        events.push(BillingEvent::CreditsPurchased {
            purchase_id: payment.id.clone(),
            customer_id: payment.customer_id.clone(),
            user_id,
            pack,
        });
    }
    events
}

fn decode<T: serde::de::DeserializeOwned>(event: &SquareEvent, key: &str) -> anyhow::Result<T> {
    let object = event
        .data
        .object
        .get(key)
        .cloned()
        .with_context(|| format!("Square {} event has no {key} object", event.event_type))?;
    serde_json::from_value(object).with_context(|| format!("failed to decode Square {key} object"))
}
