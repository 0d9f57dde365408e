//! SQLite persistence for accounts, the credit ledger and webhook bookkeeping

pub mod api_keys;
pub mod customers;
pub mod ledger;
pub mod redeem;
mod schema;
pub mod subscriptions;
pub mod tasks;
pub mod users;
pub mod webhook_events;

use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::Result;

pub use api_keys::{ApiKeyRecord, ApiKeyRepo};
pub use customers::CustomerRepo;
pub use ledger::{LedgerRepo, Transaction, TransactionKind};
pub use redeem::{RedeemOutcome, RedeemRepo};
pub use schema::SCHEMA_VERSION;
pub use subscriptions::{SubscriptionRecord, SubscriptionRepo, SubscriptionUpsert};
pub use tasks::{GenerationTask, TaskRepo};
pub use users::{ProfileRepo, User, UserProfile, UserRepo};
pub use webhook_events::{ClaimOutcome, WebhookEventRepo};

pub type DbPool = Pool<SqliteConnectionManager>;

pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Every repo bundled over one pool.
#[derive(Clone)]
pub struct Store {
    pub pool: DbPool,
    pub users: UserRepo,
    pub profiles: ProfileRepo,
    pub ledger: LedgerRepo,
    pub webhook_events: WebhookEventRepo,
    pub subscriptions: SubscriptionRepo,
    pub customers: CustomerRepo,
    pub api_keys: ApiKeyRepo,
    pub tasks: TaskRepo,
    pub redeem: RedeemRepo,
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self {
            users: UserRepo::new(pool.clone()),
            profiles: ProfileRepo::new(pool.clone()),
            ledger: LedgerRepo::new(pool.clone()),
            webhook_events: WebhookEventRepo::new(pool.clone()),
            subscriptions: SubscriptionRepo::new(pool.clone()),
            customers: CustomerRepo::new(pool.clone()),
            api_keys: ApiKeyRepo::new(pool.clone()),
            tasks: TaskRepo::new(pool.clone()),
            redeem: RedeemRepo::new(pool.clone()),
            pool,
        }
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "database initialized");
    Ok(pool)
}

/// A private in-memory database. The pool holds a single connection so every
/// repo sees the same data.
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = Pool::builder().max_size(1).build(manager)?;

    let conn = pool.get()?;
    schema::init(&conn)?;

    Ok(pool)
}

/// Opens a write transaction holding the write lock from the first statement,
/// so a read followed by a write never works from a stale WAL snapshot.
pub(crate) fn begin_write(conn: &mut DbConn) -> Result<rusqlite::Transaction<'_>> {
    Ok(conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?)
}

pub(crate) fn parse_datetime(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_opt_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}
