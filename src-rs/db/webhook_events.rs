//! Idempotency ledger for payment provider webhooks, keyed by (provider, event id)

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::{begin_write, parse_datetime, DbPool};
use crate::error::Result;

/// How long a `processing` claim is honoured before another delivery may take it over.
pub const STALE_CLAIM_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the event and must process it.
    Claimed,
    /// Another delivery already processed, or is processing, the event.
    Duplicate,
}

#[derive(Clone)]
pub struct WebhookEventRepo {
    pool: DbPool,
}

impl WebhookEventRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// First writer wins on the (provider, event_id) primary key. A claim
    /// still `processing` after [`STALE_CLAIM_MINUTES`] belonged to a worker
    /// that died mid-event and is handed to the caller instead.
    pub fn claim(&self, provider: &str, event_id: &str, event_type: &str) -> Result<ClaimOutcome> {
        let mut conn = self.pool.get()?;
        let tx = begin_write(&mut conn)?;
        let now = Utc::now();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO webhook_events (provider, event_id, event_type, status, received_at)
             VALUES (?1, ?2, ?3, 'processing', ?4)",
            params![provider, event_id, event_type, now.to_rfc3339()],
        )?;

        let outcome = if inserted == 1 {
            ClaimOutcome::Claimed
        } else {
            let stale_before = now - Duration::minutes(STALE_CLAIM_MINUTES);
            let received_at: Option<String> = tx
                .query_row(
                    "SELECT received_at FROM webhook_events
                     WHERE provider = ?1 AND event_id = ?2 AND status = 'processing'",
                    params![provider, event_id],
                    |row| row.get(0),
                )
                .optional()?;
            match received_at {
                Some(raw) if parse_datetime(&raw) < stale_before => {
                    tx.execute(
                        "UPDATE webhook_events SET received_at = ?1, event_type = ?2
                         WHERE provider = ?3 AND event_id = ?4",
                        params![now.to_rfc3339(), event_type, provider, event_id],
                    )?;
                    tracing::warn!(provider, event_id, "reclaiming stale webhook claim");
                    ClaimOutcome::Claimed
                }
                _ => ClaimOutcome::Duplicate,
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    pub fn mark_processed(&self, provider: &str, event_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE webhook_events SET status = 'processed', processed_at = ?1
             WHERE provider = ?2 AND event_id = ?3",
            params![Utc::now().to_rfc3339(), provider, event_id],
        )?;
        Ok(())
    }

    /// Drop a claim whose processing failed so the provider's retry can run it again.
    pub fn release(&self, provider: &str, event_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM webhook_events WHERE provider = ?1 AND event_id = ?2 AND status = 'processing'",
            params![provider, event_id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn status(&self, provider: &str, event_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let status = conn
            .query_row(
                "SELECT status FROM webhook_events WHERE provider = ?1 AND event_id = ?2",
                params![provider, event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn first_claim_wins() {
        let repo = WebhookEventRepo::new(init_memory().unwrap());
        assert_eq!(
            repo.claim("stripe", "evt_1", "invoice.paid").unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            repo.claim("stripe", "evt_1", "invoice.paid").unwrap(),
            ClaimOutcome::Duplicate
        );
        assert_eq!(
            repo.claim("square", "evt_1", "payment.updated").unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[test]
    fn released_claim_can_be_retried_but_processed_cannot() {
        let repo = WebhookEventRepo::new(init_memory().unwrap());
        repo.claim("stripe", "evt_2", "invoice.paid").unwrap();
        repo.release("stripe", "evt_2").unwrap();
        assert_eq!(repo.status("stripe", "evt_2").unwrap(), None);
        assert_eq!(
            repo.claim("stripe", "evt_2", "invoice.paid").unwrap(),
            ClaimOutcome::Claimed
        );

        repo.mark_processed("stripe", "evt_2").unwrap();
        repo.release("stripe", "evt_2").unwrap();
        assert_eq!(
            repo.status("stripe", "evt_2").unwrap().as_deref(),
            Some("processed")
        );
    }

    #[test]
    fn abandoned_claim_is_reclaimed_after_the_stale_window() {
        let pool = init_memory().unwrap();
        let repo = WebhookEventRepo::new(pool.clone());
        repo.claim("stripe", "evt_3", "invoice.paid").unwrap();
        assert_eq!(
            repo.claim("stripe", "evt_3", "invoice.paid").unwrap(),
            ClaimOutcome::Duplicate
        );

        let abandoned_at = Utc::now() - Duration::minutes(STALE_CLAIM_MINUTES + 1);
        pool.get()
            .unwrap()
            .execute(
                "UPDATE webhook_events SET received_at = ?1 WHERE event_id = 'evt_3'",
                [abandoned_at.to_rfc3339()],
            )
            .unwrap();
        assert_eq!(
            repo.claim("stripe", "evt_3", "invoice.paid").unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            repo.claim("stripe", "evt_3", "invoice.paid").unwrap(),
            ClaimOutcome::Duplicate
        );

        repo.mark_processed("stripe", "evt_3").unwrap();
        pool.get()
            .unwrap()
            .execute(
                "UPDATE webhook_events SET received_at = ?1 WHERE event_id = 'evt_3'",
                [abandoned_at.to_rfc3339()],
            )
            .unwrap();
        assert_eq!(
            repo.claim("stripe", "evt_3", "invoice.paid").unwrap(),
            ClaimOutcome::Duplicate
        );
    }
}
