use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{begin_write, parse_datetime, parse_opt_datetime, DbPool};
use crate::{
    error::Result,
    plans::{resolve_plan, Plan},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub provider: String,
    pub subscription_id: String,
    pub user_id: String,
    pub plan: Plan,
    pub status: String,
    pub price_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub last_event_at: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionUpsert<'a> {
    pub provider: &'a str,
    pub subscription_id: &'a str,
    pub user_id: &'a str,
    pub plan: Plan,
    pub status: &'a str,
    pub price_id: Option<&'a str>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    /// Provider-side event time, unix seconds.
    pub occurred_at: i64,
}

#[derive(Clone)]
pub struct SubscriptionRepo {
    pool: DbPool,
}

const COLUMNS: &str = "provider, subscription_id, user_id, plan, status, price_id, \
     current_period_end, cancel_at_period_end, last_event_at, updated_at";

pub fn is_terminal_status(status: &str) -> bool {
    matches!(
        status.to_ascii_lowercase().as_str(),
        "canceled" | "incomplete_expired" | "deactivated"
    )
}

impl SubscriptionRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Writes the state unless a newer event was already applied. Returns
    /// `false` when the update was stale and skipped.
    pub fn upsert_if_newer(&self, update: &SubscriptionUpsert<'_>) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = begin_write(&mut conn)?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT last_event_at, status FROM subscriptions WHERE provider = ?1 AND subscription_id = ?2",
                params![update.provider, update.subscription_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((last_event_at, status)) = existing {
            let stale = update.occurred_at < last_event_at
                || (update.occurred_at == last_event_at
                    && is_terminal_status(&status)
                    && !is_terminal_status(update.status));
            if stale {
                tracing::info!(
                    provider = update.provider,
                    subscription_id = update.subscription_id,
                    occurred_at = update.occurred_at,
                    last_event_at,
                    "skipping out-of-order subscription event"
                );
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO subscriptions (provider, subscription_id, user_id, plan, status, price_id,
                 current_period_end, cancel_at_period_end, last_event_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(provider, subscription_id) DO UPDATE SET
                 user_id = excluded.user_id,
                 plan = excluded.plan,
                 status = excluded.status,
                 price_id = COALESCE(excluded.price_id, subscriptions.price_id),
                 current_period_end = COALESCE(excluded.current_period_end, subscriptions.current_period_end),
                 cancel_at_period_end = excluded.cancel_at_period_end,
                 last_event_at = excluded.last_event_at,
                 updated_at = excluded.updated_at",
            params![
                update.provider,
                update.subscription_id,
                update.user_id,
                update.plan.as_str(),
                update.status,
                update.price_id,
                update.current_period_end.map(|dt| dt.to_rfc3339()),
                update.cancel_at_period_end,
                update.occurred_at,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn find(&self, provider: &str, subscription_id: &str) -> Result<Option<SubscriptionRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM subscriptions WHERE provider = ?1 AND subscription_id = ?2"),
                params![provider, subscription_id],
                map_subscription,
            )
            .optional()?;
        Ok(record)
    }

    pub fn latest_for_user(&self, user_id: &str) -> Result<Option<SubscriptionRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM subscriptions WHERE user_id = ?1
                     ORDER BY last_event_at DESC LIMIT 1"
                ),
                [user_id],
                map_subscription,
            )
            .optional()?;
        Ok(record)
    }
}

fn map_subscription(row: &Row<'_>) -> rusqlite::Result<SubscriptionRecord> {
    let plan: String = row.get(3)?;
    Ok(SubscriptionRecord {
        provider: row.get(0)?,
        subscription_id: row.get(1)?,
        user_id: row.get(2)?,
        plan: resolve_plan(Some(&plan)),
        status: row.get(4)?,
        price_id: row.get(5)?,
        current_period_end: parse_opt_datetime(row.get(6)?),
        cancel_at_period_end: row.get(7)?,
        last_event_at: row.get(8)?,
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}
