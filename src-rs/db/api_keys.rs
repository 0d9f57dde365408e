//! API keys issued by the generation backend. Only a SHA-256 digest of the key
//! is stored; the raw value is shown to the user once.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{parse_datetime, parse_opt_datetime, DbPool};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub backend_key_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

pub fn hash_api_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.trim().as_bytes()))
}

fn key_prefix(raw_key: &str) -> String {
    raw_key.trim().chars().take(8).collect()
}

const COLUMNS: &str =
    "id, user_id, name, key_prefix, backend_key_id, created_at, last_used_at, revoked_at";

#[derive(Clone)]
pub struct ApiKeyRepo {
    pool: DbPool,
}

impl ApiKeyRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create(
        &self,
        user_id: &str,
        name: &str,
        raw_key: &str,
        backend_key_id: Option<&str>,
    ) -> Result<ApiKeyRecord> {
        let conn = self.pool.get()?;
        let record = ApiKeyRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            key_prefix: key_prefix(raw_key),
            backend_key_id: backend_key_id.map(str::to_string),
            created_at: Utc::now(),
            last_used_at: None,
            revoked_at: None,
        };
        conn.execute(
            "INSERT INTO api_keys (id, user_id, name, key_hash, key_prefix, backend_key_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.user_id,
                record.name,
                hash_api_key(raw_key),
                record.key_prefix,
                record.backend_key_id,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    pub fn list_active(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM api_keys WHERE user_id = ?1 AND revoked_at IS NULL
             ORDER BY created_at DESC"
        ))?;
        let keys = stmt
            .query_map([user_id], map_key)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// Resolves a raw key to its active record and stamps `last_used_at`.
    pub fn authenticate(&self, raw_key: &str) -> Result<Option<ApiKeyRecord>> {
        let conn = self.pool.get()?;
        let hash = hash_api_key(raw_key);
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM api_keys WHERE key_hash = ?1 AND revoked_at IS NULL"),
                [&hash],
                map_key,
            )
            .optional()?;

        if let Some(record) = &record {
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), record.id],
            )?;
        }
        Ok(record)
    }

    /// Returns the revoked record, or `None` when the user owns no such active key.
    pub fn revoke(&self, user_id: &str, key_id: &str) -> Result<Option<ApiKeyRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM api_keys WHERE id = ?1 AND user_id = ?2 AND revoked_at IS NULL"
                ),
                params![key_id, user_id],
                map_key,
            )
            .optional()?;

        let Some(mut record) = record else {
            return Ok(None);
        };

        let now = Utc::now();
        conn.execute(
            "UPDATE api_keys SET revoked_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), record.id],
        )?;
        record.revoked_at = Some(now);
        Ok(Some(record))
    }
}

fn map_key(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        key_prefix: row.get(3)?,
        backend_key_id: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        last_used_at: parse_opt_datetime(row.get(6)?),
        revoked_at: parse_opt_datetime(row.get(7)?),
    })
}
