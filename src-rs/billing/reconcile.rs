use chrono::{Duration, Utc};

use super::{stripe_events, BillingEvent, Provider, SubscriptionSnapshot};
use crate::{
    accounts,
    db::{subscriptions::is_terminal_status, users::ProfileSubscriptionState, SubscriptionUpsert},
    error::Error,
    plans::{is_subscription_active, CreditPack, Plan},
    state::AppState,
};

/// Applies one billing event to local state.
///
/// Conditions a retry cannot fix (unknown customer, unmapped price) are
/// logged and return `Ok`. Storage and provider API failures return `Err`.
pub async fn apply(state: &AppState, provider: Provider, event: &BillingEvent) -> anyhow::Result<()> {
    match event {
        BillingEvent::CustomerLinked {
            customer_id,
            user_id,
        } => link_customer(state, provider, customer_id, user_id),
        BillingEvent::SubscriptionChanged(snapshot) => {
            apply_subscription(state, provider, snapshot, false).await
        }
        BillingEvent::SubscriptionEnded(snapshot) => {
            apply_subscription(state, provider, snapshot, true).await
        }
        BillingEvent::PeriodPaid {
            invoice_id,
            customer_id,
            subscription_id,
            plan,
            period_end,
        } => {
            if let (Provider::Stripe, Some(subscription_id)) = (provider, subscription_id.as_deref()) {
                backfill_stripe_subscription(state, subscription_id).await?;
            }
            let Some(user_id) = resolve_invoice_user(
                state,
                provider,
                customer_id.as_deref(),
                subscription_id.as_deref(),
            )
            .await?
            else {
                tracing::warn!(provider = provider.as_str(), invoice_id = %invoice_id, "paid invoice for unknown customer");
                return Ok(());
            };

            let plan = match plan {
                Some(plan) => Some(*plan),
                None => stored_plan(state, provider, subscription_id.as_deref())?,
            };
            if plan != Some(Plan::Pro) {
                tracing::info!(provider = provider.as_str(), invoice_id = %invoice_id, "paid invoice is not for a credit plan");
                return Ok(());
            }

            accounts::ensure_profile(state, &user_id)?;
            let credits = state.config.pro_monthly_credits;
            if credits <= 0 {
                return Ok(());
            }
            let reference = format!("{}:invoice:{invoice_id}", provider.as_str());
            let granted = state.store.ledger.grant(
                &user_id,
                credits,
                "subscription period credits",
                Some(&reference),
            )?;
            if granted.is_none() {
                tracing::info!(user_id = %user_id, reference = %reference, "period credits already granted");
                return Ok(());
            }

            accounts::mirror_credit_pack(state, &user_id, credits, *period_end, &reference).await;
            Ok(())
        }
        BillingEvent::PaymentFailed {
            invoice_id,
            customer_id,
            subscription_id,
        } => {
            let Some(user_id) = resolve_invoice_user(
                state,
                provider,
                customer_id.as_deref(),
                subscription_id.as_deref(),
            )
            .await?
            else {
                tracing::warn!(provider = provider.as_str(), invoice_id = %invoice_id, "failed invoice for unknown customer");
                return Ok(());
            };

            let profile = accounts::ensure_profile(state, &user_id)?;
            let matches_profile = match (profile.subscription_id.as_deref(), subscription_id.as_deref()) {
                (Some(current), Some(failed)) => current == failed,
                _ => true,
            };
            if matches_profile {
                state
                    .store
                    .profiles
                    .set_subscription_status(&user_id, "past_due")?;
            }
            tracing::warn!(user_id = %user_id, invoice_id = %invoice_id, "subscription payment failed");
            Ok(())
        }
        BillingEvent::CreditsPurchased {
            purchase_id,
            customer_id,
            user_id,
            pack,
        } => {
            let Some(user_id) =
                resolve_user(state, provider, customer_id.as_deref(), user_id.as_deref()).await?
            else {
                tracing::warn!(provider = provider.as_str(), purchase_id = %purchase_id, "credit purchase for unknown user");
                return Ok(());
            };
            grant_pack(state, provider, &user_id, purchase_id, *pack).await
        }
    }
}

fn link_customer(
    state: &AppState,
    provider: Provider,
    customer_id: &str,
    user_id: &str,
) -> anyhow::Result<()> {
    if state.store.users.find(user_id)?.is_none() {
        tracing::warn!(provider = provider.as_str(), customer_id, user_id, "cannot link customer to unknown user");
        return Ok(());
    }
    match state
        .store
        .customers
        .link(provider.as_str(), customer_id, user_id)
    {
        Ok(()) => Ok(()),
        Err(Error::Conflict(message)) => {
            tracing::warn!(provider = provider.as_str(), customer_id, user_id, %message, "customer link rejected");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

async fn apply_subscription(
    state: &AppState,
    provider: Provider,
    snapshot: &SubscriptionSnapshot,
    ended: bool,
) -> anyhow::Result<()> {
    let Some(user_id) = resolve_user(
        state,
        provider,
        snapshot.customer_id.as_deref(),
        snapshot.user_id.as_deref(),
    )
    .await?
    else {
        tracing::warn!(
            provider = provider.as_str(),
            subscription_id = %snapshot.subscription_id,
            "subscription event for unknown customer"
        );
        return Ok(());
    };

    let existing = state
        .store
        .subscriptions
        .find(provider.as_str(), &snapshot.subscription_id)?;
    let plan = snapshot
        .plan
        .or(existing.as_ref().map(|record| record.plan))
        .unwrap_or(Plan::Free);

    let applied = state.store.subscriptions.upsert_if_newer(&SubscriptionUpsert {
        provider: provider.as_str(),
        subscription_id: &snapshot.subscription_id,
        user_id: &user_id,
        plan,
        status: &snapshot.status,
        price_id: snapshot.price_id.as_deref(),
        current_period_end: snapshot.current_period_end,
        cancel_at_period_end: snapshot.cancel_at_period_end,
        occurred_at: snapshot.occurred_at,
    })?;
    if !applied {
        return Ok(());
    }

    let profile = accounts::ensure_profile(state, &user_id)?;
    let active = !ended
        && !is_terminal_status(&snapshot.status)
        && is_subscription_active(Some(&snapshot.status));
    let effective_plan = if active { plan } else { Plan::Free };

    // An inactive subscription only downgrades the profile it currently drives.
    let drives_profile = active
        || profile
            .subscription_id
            .as_deref()
            .map_or(true, |current| current == snapshot.subscription_id);
    if !drives_profile {
        tracing::info!(
            user_id = %user_id,
            subscription_id = %snapshot.subscription_id,
            "inactive subscription does not drive the profile, skipping"
        );
        return Ok(());
    }

    state.store.profiles.apply_subscription_state(
        &user_id,
        &ProfileSubscriptionState {
            plan: effective_plan,
            status: &snapshot.status,
            provider: provider.as_str(),
            subscription_id: Some(&snapshot.subscription_id),
            current_period_end: snapshot.current_period_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
        },
    )?;
    tracing::info!(
        user_id = %user_id,
        provider = provider.as_str(),
        subscription_id = %snapshot.subscription_id,
        status = %snapshot.status,
        plan = effective_plan.as_str(),
        "subscription state applied"
    );

    if profile.plan != effective_plan {
        accounts::sync_backend_tier(state, &user_id, effective_plan).await;
    }
    Ok(())
}

/// An invoice can arrive before its subscription's own events. Fetches the
/// subscription from Stripe and applies it so the plan and owner are known.
async fn backfill_stripe_subscription(state: &AppState, subscription_id: &str) -> anyhow::Result<()> {
    if !state.stripe.is_configured()
        || state
            .store
            .subscriptions
            .find(Provider::Stripe.as_str(), subscription_id)?
            .is_some()
    {
        return Ok(());
    }

    let subscription = state.stripe.retrieve_subscription(subscription_id).await?;
    tracing::info!(subscription_id, status = %subscription.status, "backfilling subscription ahead of its events");
    let snapshot = stripe_events::snapshot(&subscription, &state.price_map, Utc::now().timestamp());
    apply_subscription(state, Provider::Stripe, &snapshot, false).await
}

async fn grant_pack(
    state: &AppState,
    provider: Provider,
    user_id: &str,
    purchase_id: &str,
    pack: CreditPack,
) -> anyhow::Result<()> {
    accounts::ensure_profile(state, user_id)?;
    let reference = format!("{}:purchase:{purchase_id}", provider.as_str());
    let granted = state.store.ledger.grant(
        user_id,
        pack.credits(),
        &format!("credit pack {}", pack.as_str()),
        Some(&reference),
    )?;
    if granted.is_none() {
        tracing::info!(user_id, reference = %reference, "credit pack already granted");
        return Ok(());
    }

    let expires_at = Utc::now() + Duration::days(365);
    accounts::mirror_credit_pack(state, user_id, pack.credits(), Some(expires_at), &reference).await;
    Ok(())
}

/// Local customer mapping first, then a user id carried by the event, then
/// (Stripe only) the `userId` metadata on the customer object.
async fn resolve_user(
    state: &AppState,
    provider: Provider,
    customer_id: Option<&str>,
    hinted_user_id: Option<&str>,
) -> anyhow::Result<Option<String>> {
    if let Some(customer_id) = customer_id {
        if let Some(user_id) = state
            .store
            .customers
            .user_for_customer(provider.as_str(), customer_id)?
        {
            return Ok(Some(user_id));
        }
    }

    if let Some(user_id) = hinted_user_id.filter(|id| !id.trim().is_empty()) {
        if state.store.users.find(user_id)?.is_some() {
            if let Some(customer_id) = customer_id {
                link_customer(state, provider, customer_id, user_id)?;
            }
            return Ok(Some(user_id.to_string()));
        }
    }

    let (Provider::Stripe, Some(customer_id)) = (provider, customer_id) else {
        return Ok(None);
    };
    if !state.stripe.is_configured() {
        return Ok(None);
    }

    let customer = state.stripe.retrieve_customer(customer_id).await?;
    if customer.deleted {
        return Ok(None);
    }
    let Some(user_id) = customer.metadata.get("userId").cloned() else {
        return Ok(None);
    };
    if state.store.users.find(&user_id)?.is_none() {
        return Ok(None);
    }
    link_customer(state, provider, customer_id, &user_id)?;
    Ok(Some(user_id))
}

async fn resolve_invoice_user(
    state: &AppState,
    provider: Provider,
    customer_id: Option<&str>,
    subscription_id: Option<&str>,
) -> anyhow::Result<Option<String>> {
    if let Some(subscription_id) = subscription_id {
        if let Some(record) = state
            .store
            .subscriptions
            .find(provider.as_str(), subscription_id)?
        {
            return Ok(Some(record.user_id));
        }
    }
    resolve_user(state, provider, customer_id, None).await
}

fn stored_plan(
    state: &AppState,
    provider: Provider,
    subscription_id: Option<&str>,
) -> anyhow::Result<Option<Plan>> {
    let Some(subscription_id) = subscription_id else {
        return Ok(None);
    };
    Ok(state
        .store
        .subscriptions
        .find(provider.as_str(), subscription_id)?
        .map(|record| record.plan))
}
