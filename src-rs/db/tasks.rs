use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{parse_datetime, DbPool};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    pub task_id: String,
    pub user_id: String,
    pub kind: String,
    pub cost: i64,
    pub status: String,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "task_id, user_id, kind, cost, status, refunded, created_at, updated_at";

#[derive(Clone)]
pub struct TaskRepo {
    pool: DbPool,
}

impl TaskRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create(&self, task_id: &str, user_id: &str, kind: &str, cost: i64) -> Result<GenerationTask> {
        let conn = self.pool.get()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO generation_tasks (task_id, user_id, kind, cost, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'submitted', ?5, ?5)",
            params![task_id, user_id, kind, cost, now.to_rfc3339()],
        )?;
        Ok(GenerationTask {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            cost,
            status: "submitted".to_string(),
            refunded: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Only returns the task when `user_id` owns it.
    pub fn find_for_user(&self, task_id: &str, user_id: &str) -> Result<Option<GenerationTask>> {
        let conn = self.pool.get()?;
        let task = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM generation_tasks WHERE task_id = ?1 AND user_id = ?2"),
                params![task_id, user_id],
                map_task,
            )
            .optional()?;
        Ok(task)
    }

    pub fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<GenerationTask>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM generation_tasks WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let tasks = stmt
            .query_map(params![user_id, limit as i64], map_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn update_status(&self, task_id: &str, status: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE generation_tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3",
            params![status, Utc::now().to_rfc3339(), task_id],
        )?;
        Ok(())
    }

    /// Flips the refunded flag. `true` only for the caller that flipped it.
    pub fn mark_refunded(&self, task_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE generation_tasks SET refunded = 1, updated_at = ?1 WHERE task_id = ?2 AND refunded = 0",
            params![Utc::now().to_rfc3339(), task_id],
        )?;
        Ok(updated == 1)
    }
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<GenerationTask> {
    Ok(GenerationTask {
        task_id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        cost: row.get(3)?,
        status: row.get(4)?,
        refunded: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        updated_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}
