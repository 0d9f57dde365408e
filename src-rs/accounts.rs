//! Local profile bootstrap and the best-effort mirror into the generation
//! backend's own account system.

use chrono::{DateTime, Duration, Utc};

use crate::{
    db::{User, UserProfile},
    error::Result,
    plans::Plan,
    state::AppState,
};

/// Loads the user's profile, creating it on first access. New profiles start
/// at zero and receive the welcome credits through the ledger, in the same
/// SQL transaction as the insert.
pub fn ensure_profile(state: &AppState, user_id: &str) -> Result<UserProfile> {
    let (profile, created) = state
        .store
        .profiles
        .get_or_create_with_welcome(user_id, state.config.welcome_credits)?;
    if created {
        tracing::info!(
            user_id,
            welcome_credits = profile.credits,
            "created user profile"
        );
    }
    Ok(profile)
}

/// Returns the backend account id, creating the backend account when the
/// profile has none yet. Failures are logged and yield `None`.
pub async fn ensure_backend_account(
    state: &AppState,
    user: &User,
    profile: &UserProfile,
) -> Option<String> {
    if let Some(account_id) = profile.backend_account_id() {
        return Some(account_id.to_string());
    }

    let account = match state
        .backend
        .create_account(&user.email, &user.id, profile.plan.backend_tier())
        .await
    {
        Ok(account) => account,
        Err(error) => {
            tracing::warn!(user_id = %user.id, error = %error, "failed to create backend account");
            return None;
        }
    };

    if let Err(error) = state
        .store
        .profiles
        .set_backend_account_id(&user.id, &account.id)
    {
        tracing::error!(user_id = %user.id, error = %error, "failed to store backend account id");
        return None;
    }

    tracing::info!(user_id = %user.id, account_id = %account.id, "backend account created");
    Some(account.id)
}

/// Pushes the plan's tier to the backend account, if the user has one.
pub async fn sync_backend_tier(state: &AppState, user_id: &str, plan: Plan) {
    let account_id = match state.store.profiles.find(user_id) {
        Ok(Some(profile)) => profile.backend_account_id().map(str::to_string),
        Ok(None) => None,
        Err(error) => {
            tracing::warn!(user_id, error = %error, "failed to load profile for tier sync");
            return;
        }
    };
    let Some(account_id) = account_id else {
        tracing::debug!(user_id, "no backend account, skipping tier sync");
        return;
    };

    match state
        .backend
        .update_account_tier(&account_id, plan.backend_tier())
        .await
    {
        Ok(()) => tracing::info!(user_id, tier = plan.backend_tier(), "backend tier updated"),
        Err(error) => {
            tracing::warn!(user_id, account_id = %account_id, error = %error, "backend tier sync failed")
        }
    }
}

/// Mirrors granted credits as a backend credit pack.
pub async fn mirror_credit_pack(
    state: &AppState,
    user_id: &str,
    credits: i64,
    expires_at: Option<DateTime<Utc>>,
    reference: &str,
) {
    let account_id = match state.store.profiles.find(user_id) {
        Ok(profile) => profile.and_then(|p| p.backend_account_id().map(str::to_string)),
        Err(error) => {
            tracing::warn!(user_id, error = %error, "failed to load profile for credit pack mirror");
            return;
        }
    };
    let Some(account_id) = account_id else {
        tracing::debug!(user_id, reference, "no backend account, credit pack not mirrored");
        return;
    };

    let expires_at = expires_at.unwrap_or_else(|| Utc::now() + Duration::days(31));
    match state
        .backend
        .create_credit_pack(&account_id, credits, Some(expires_at), reference)
        .await
    {
        Ok(receipt) => {
            tracing::info!(user_id, reference, pack_id = %receipt.id, credits, "credit pack mirrored")
        }
        Err(error) => {
            tracing::warn!(user_id, reference, error = %error, "credit pack mirror failed")
        }
    }
}
