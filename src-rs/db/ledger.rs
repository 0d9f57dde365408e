//! Credit ledger: every balance change is one transaction row written in the
//! same SQL transaction as the balance update.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use super::{begin_write, parse_datetime, DbPool};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Grant,
    Spend,
    Refund,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Grant => "grant",
            TransactionKind::Spend => "spend",
            TransactionKind::Refund => "refund",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "spend" => TransactionKind::Spend,
            "refund" => TransactionKind::Refund,
            _ => TransactionKind::Grant,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub kind: TransactionKind,
    /// Signed: spends are negative.
    pub amount: i64,
    pub balance_after: i64,
    pub reason: String,
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LedgerRepo {
    pool: DbPool,
}

impl LedgerRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Add `amount` credits. Returns `None` when `reference` was already used,
    /// in which case nothing changes.
    pub fn grant(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        reference: Option<&str>,
    ) -> Result<Option<Transaction>> {
        if amount <= 0 {
            return Err(Error::InvalidInput(format!(
                "grant amount must be positive, got {amount}"
            )));
        }
        self.apply(user_id, TransactionKind::Grant, amount, reason, reference)
    }

    pub fn refund(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        reference: &str,
    ) -> Result<Option<Transaction>> {
        if amount <= 0 {
            return Err(Error::InvalidInput(format!(
                "refund amount must be positive, got {amount}"
            )));
        }
        self.apply(
            user_id,
            TransactionKind::Refund,
            amount,
            reason,
            Some(reference),
        )
    }

    /// Remove `amount` credits. Fails with `InsufficientCredits` and leaves the
    /// balance untouched when it would go negative.
    pub fn spend(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        reference: Option<&str>,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(Error::InvalidInput(format!(
                "spend amount must be positive, got {amount}"
            )));
        }
        self.apply(user_id, TransactionKind::Spend, -amount, reason, reference)?
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "spend reference {} already recorded",
                    reference.unwrap_or_default()
                ))
            })
    }

    pub fn balance(&self, user_id: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT credits FROM user_profiles WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("profile for user {user_id}")))
    }

    pub fn history(&self, user_id: &str, limit: usize) -> Result<Vec<Transaction>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, amount, balance_after, reason, reference, created_at
             FROM transactions WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], map_transaction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn find_by_reference(&self, reference: &str) -> Result<Option<Transaction>> {
        let conn = self.pool.get()?;
        let transaction = conn
            .query_row(
                "SELECT id, user_id, kind, amount, balance_after, reason, reference, created_at
                 FROM transactions WHERE reference = ?1",
                [reference],
                map_transaction,
            )
            .optional()?;
        Ok(transaction)
    }

    fn apply(
        &self,
        user_id: &str,
        kind: TransactionKind,
        delta: i64,
        reason: &str,
        reference: Option<&str>,
    ) -> Result<Option<Transaction>> {
        let mut conn = self.pool.get()?;
        let tx = begin_write(&mut conn)?;
        let transaction = apply_in(&tx, user_id, kind, delta, reason, reference)?;
        let Some(transaction) = transaction else {
            return Ok(None);
        };
        tx.commit()?;

        tracing::info!(
            user_id,
            kind = kind.as_str(),
            amount = delta,
            balance_after = transaction.balance_after,
            reason,
            "ledger transaction recorded"
        );
        Ok(Some(transaction))
    }
}

/// Balance update plus transaction row on an already-open SQL transaction.
/// The caller commits on `Some` and rolls back on `None`.
pub(crate) fn apply_in(
    conn: &Connection,
    user_id: &str,
    kind: TransactionKind,
    delta: i64,
    reason: &str,
    reference: Option<&str>,
) -> Result<Option<Transaction>> {
    if let Some(reference) = reference {
        let seen: Option<String> = conn
            .query_row(
                "SELECT id FROM transactions WHERE reference = ?1",
                [reference],
                |row| row.get(0),
            )
            .optional()?;
        if seen.is_some() {
            tracing::info!(user_id, reference, "ledger reference already applied");
            return Ok(None);
        }
    }

    let balance: i64 = conn
        .query_row(
            "SELECT credits FROM user_profiles WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("profile for user {user_id}")))?;

    let balance_after = balance
        .checked_add(delta)
        .ok_or_else(|| Error::InvalidInput("credit balance overflow".into()))?;
    if balance_after < 0 {
        return Err(Error::InsufficientCredits {
            balance,
            required: -delta,
        });
    }

    let now = Utc::now();
    conn.execute(
        "UPDATE user_profiles SET credits = ?1, updated_at = ?2 WHERE user_id = ?3",
        params![balance_after, now.to_rfc3339(), user_id],
    )?;

    let transaction = Transaction {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        kind,
        amount: delta,
        balance_after,
        reason: reason.to_string(),
        reference: reference.map(str::to_string),
        created_at: now,
    };
    let inserted = conn.execute(
        "INSERT INTO transactions (id, user_id, kind, amount, balance_after, reason, reference, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            transaction.id,
            transaction.user_id,
            kind.as_str(),
            transaction.amount,
            transaction.balance_after,
            transaction.reason,
            transaction.reference,
            now.to_rfc3339(),
        ],
    );
    match inserted {
        Ok(_) => {}
        // A concurrent writer recorded the same reference first. The caller
        // must not commit, which rolls the balance update back.
        Err(rusqlite::Error::SqliteFailure(code, _))
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE && reference.is_some() =>
        {
            return Ok(None);
        }
        Err(error) => return Err(error.into()),
    }

    Ok(Some(transaction))
}

fn map_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: TransactionKind::parse(&row.get::<_, String>(2)?),
        amount: row.get(3)?,
        balance_after: row.get(4)?,
        reason: row.get(5)?,
        reference: row.get(6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}
