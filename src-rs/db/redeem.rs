use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{
    ledger::{apply_in, TransactionKind},
    begin_write, parse_opt_datetime, DbPool,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RedeemOutcome {
    Redeemed { credits: i64, balance_after: i64 },
    AlreadyRedeemed,
    Exhausted,
    Expired,
    Unknown,
}

#[derive(Clone)]
pub struct RedeemRepo {
    pool: DbPool,
}

impl RedeemRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create_code(
        &self,
        code: &str,
        credits: i64,
        max_uses: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if credits <= 0 || max_uses <= 0 {
            return Err(Error::InvalidInput(
                "redeem codes need positive credits and uses".into(),
            ));
        }
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO redeem_codes (code, credits, max_uses, uses, expires_at, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![
                normalize_code(code),
                credits,
                max_uses,
                expires_at.map(|dt| dt.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Conflict("redeem code already exists".into())
            }
            other => other.into(),
        })?;
        Ok(())
    }

    /// Consumes one use of `code` for `user_id` and grants its credits in the
    /// same SQL transaction.
    pub fn redeem(&self, code: &str, user_id: &str) -> Result<RedeemOutcome> {
        let code = normalize_code(code);
        let mut conn = self.pool.get()?;
        let tx = begin_write(&mut conn)?;

        let row: Option<(i64, i64, i64, Option<String>)> = tx
            .query_row(
                "SELECT credits, max_uses, uses, expires_at FROM redeem_codes WHERE code = ?1",
                [&code],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((credits, max_uses, uses, expires_at)) = row else {
            return Ok(RedeemOutcome::Unknown);
        };
        if parse_opt_datetime(expires_at).is_some_and(|expires_at| expires_at <= Utc::now()) {
            return Ok(RedeemOutcome::Expired);
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO redemptions (code, user_id, redeemed_at) VALUES (?1, ?2, ?3)",
            params![code, user_id, Utc::now().to_rfc3339()],
        )?;
        if inserted == 0 {
            return Ok(RedeemOutcome::AlreadyRedeemed);
        }
        if uses >= max_uses {
            return Ok(RedeemOutcome::Exhausted);
        }

        tx.execute(
            "UPDATE redeem_codes SET uses = uses + 1 WHERE code = ?1",
            [&code],
        )?;

        let reference = format!("redeem:{code}:{user_id}");
        let Some(transaction) = apply_in(
            &tx,
            user_id,
            TransactionKind::Grant,
            credits,
            "redeem code",
            Some(&reference),
        )?
        else {
            return Ok(RedeemOutcome::AlreadyRedeemed);
        };
        tx.commit()?;

        tracing::info!(user_id, code = %code, credits, "redeem code applied");
        Ok(RedeemOutcome::Redeemed {
            credits,
            balance_after: transaction.balance_after,
        })
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
