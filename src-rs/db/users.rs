//! Users and their billing profile

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};

use super::{
    begin_write,
    ledger::{apply_in, TransactionKind},
    parse_datetime, parse_opt_datetime, DbPool,
};
use crate::{
    error::{Error, Result},
    plans::{resolve_plan, Plan},
};

pub const BACKEND_ACCOUNT_KEY: &str = "backendAccountId";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub plan: Plan,
    pub credits: i64,
    pub subscription_status: Option<String>,
    pub subscription_provider: Option<String>,
    pub subscription_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub preferences: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn backend_account_id(&self) -> Option<&str> {
        self.preferences
            .get(BACKEND_ACCOUNT_KEY)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Subscription fields mirrored onto the profile.
#[derive(Debug, Clone)]
pub struct ProfileSubscriptionState<'a> {
    pub plan: Plan,
    pub status: &'a str,
    pub provider: &'a str,
    pub subscription_id: Option<&'a str>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

#[derive(Clone)]
pub struct UserRepo {
    pool: DbPool,
}

impl UserRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert the user or refresh email/name from the latest session.
    pub fn upsert(&self, id: &str, email: &str, name: Option<&str>) -> Result<User> {
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("user id is empty".into()));
        }
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET email = excluded.email, name = COALESCE(excluded.name, users.name)",
            params![id, email, name, now],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Conflict(format!("email {email} already belongs to another user"))
            }
            other => other.into(),
        })?;

        conn.query_row(
            "SELECT id, email, name, created_at FROM users WHERE id = ?1",
            [id],
            map_user,
        )
        .map_err(Into::into)
    }

    pub fn find(&self, id: &str) -> Result<Option<User>> {
        let conn = self.pool.get()?;
        let user = conn
            .query_row(
                "SELECT id, email, name, created_at FROM users WHERE id = ?1",
                [id],
                map_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.pool.get()?;
        let user = conn
            .query_row(
                "SELECT id, email, name, created_at FROM users WHERE lower(email) = lower(?1)",
                [email.trim()],
                map_user,
            )
            .optional()?;
        Ok(user)
    }
}

#[derive(Clone)]
pub struct ProfileRepo {
    pool: DbPool,
}

const PROFILE_COLUMNS: &str = "user_id, plan, credits, subscription_status, subscription_provider, \
     subscription_id, current_period_end, cancel_at_period_end, preferences, created_at, updated_at";

impl ProfileRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Returns the profile and whether this call created it. New profiles start
    /// with zero credits on the free plan.
    pub fn get_or_create(&self, user_id: &str) -> Result<(UserProfile, bool)> {
        self.get_or_create_with_welcome(user_id, 0)
    }

    /// Like [`ProfileRepo::get_or_create`], granting `welcome_credits` in the
    /// same SQL transaction as the insert. Either both land or neither does.
    pub fn get_or_create_with_welcome(
        &self,
        user_id: &str,
        welcome_credits: i64,
    ) -> Result<(UserProfile, bool)> {
        let mut conn = self.pool.get()?;
        let tx = begin_write(&mut conn)?;
        let now = Utc::now().to_rfc3339();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO user_profiles (user_id, plan, credits, created_at, updated_at)
             VALUES (?1, 'free', 0, ?2, ?2)",
            params![user_id, now],
        )? == 1;

        if inserted && welcome_credits > 0 {
            let reference = format!("welcome:{user_id}");
            apply_in(
                &tx,
                user_id,
                TransactionKind::Grant,
                welcome_credits,
                "welcome credits",
                Some(&reference),
            )?;
        }

        let profile = tx.query_row(
            &format!("SELECT {PROFILE_COLUMNS} FROM user_profiles WHERE user_id = ?1"),
            [user_id],
            map_profile,
        )?;
        tx.commit()?;

        Ok((profile, inserted))
    }

    pub fn find(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let conn = self.pool.get()?;
        let profile = conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM user_profiles WHERE user_id = ?1"),
                [user_id],
                map_profile,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn get(&self, user_id: &str) -> Result<UserProfile> {
        self.find(user_id)?
            .ok_or_else(|| Error::NotFound(format!("profile for user {user_id}")))
    }

    pub fn apply_subscription_state(
        &self,
        user_id: &str,
        state: &ProfileSubscriptionState<'_>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE user_profiles
             SET plan = ?1, subscription_status = ?2, subscription_provider = ?3,
                 subscription_id = ?4, current_period_end = ?5, cancel_at_period_end = ?6,
                 updated_at = ?7
             WHERE user_id = ?8",
            params![
                state.plan.as_str(),
                state.status,
                state.provider,
                state.subscription_id,
                state.current_period_end.map(|dt| dt.to_rfc3339()),
                state.cancel_at_period_end,
                Utc::now().to_rfc3339(),
                user_id,
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("profile for user {user_id}")));
        }
        Ok(())
    }

    pub fn set_subscription_status(&self, user_id: &str, status: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE user_profiles SET subscription_status = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![status, Utc::now().to_rfc3339(), user_id],
        )?;
        Ok(())
    }

    pub fn set_backend_account_id(&self, user_id: &str, account_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE user_profiles
             SET preferences = json_set(preferences, '$.backendAccountId', ?1), updated_at = ?2
             WHERE user_id = ?3",
            params![account_id, Utc::now().to_rfc3339(), user_id],
        )?;
        Ok(())
    }

    /// Shallow-merge `patch` into the preferences blob. `null` values remove keys.
    pub fn merge_preferences(
        &self,
        user_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut conn = self.pool.get()?;
        let tx = begin_write(&mut conn)?;

        let raw: String = tx
            .query_row(
                "SELECT preferences FROM user_profiles WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("profile for user {user_id}")))?;

        let mut preferences = parse_preferences(&raw);
        for (key, value) in patch {
            if value.is_null() {
                preferences.remove(key);
            } else {
                preferences.insert(key.clone(), value.clone());
            }
        }

        tx.execute(
            "UPDATE user_profiles SET preferences = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![
                serde_json::to_string(&preferences)?,
                Utc::now().to_rfc3339(),
                user_id
            ],
        )?;
        tx.commit()?;

        Ok(preferences)
    }
}

fn parse_preferences(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

fn map_profile(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    let plan: String = row.get(1)?;
    Ok(UserProfile {
        user_id: row.get(0)?,
        plan: resolve_plan(Some(&plan)),
        credits: row.get(2)?,
        subscription_status: row.get(3)?,
        subscription_provider: row.get(4)?,
        subscription_id: row.get(5)?,
        current_period_end: parse_opt_datetime(row.get(6)?),
        cancel_at_period_end: row.get(7)?,
        preferences: parse_preferences(&row.get::<_, String>(8)?),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}
