//! Reminder store.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use hearth_types::error::RepositoryError;
use hearth_types::memory::Reminder;

use super::extract;

/// A `schedule_reminder` call after service-level validation.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub user_id: Uuid,
    pub remind_at: DateTime<Utc>,
    pub payload: Value,
    pub memory_id: Option<Uuid>,
    pub channel: Option<String>,
    /// Idempotence key: scheduling twice with the same key moves the
    /// existing row instead of inserting a duplicate.
    pub external_key: Option<String>,
}

#[derive(Clone)]
pub struct ReminderStore {
    pool: PgPool,
}

impl ReminderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn schedule(&self, req: &ScheduleRequest) -> Result<Uuid, RepositoryError> {
        let id = Uuid::now_v7();
        if req.external_key.is_some() {
            let row: (Uuid,) = sqlx::query_as(
                "INSERT INTO reminders (id, user_id, memory_id, remind_at, payload, channel, external_key) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (user_id, external_key) WHERE external_key IS NOT NULL \
                 DO UPDATE SET remind_at = EXCLUDED.remind_at, payload = EXCLUDED.payload, \
                               channel = EXCLUDED.channel, sent_at = NULL \
                 RETURNING id",
            )
            .bind(id)
            .bind(req.user_id)
            .bind(req.memory_id)
            .bind(req.remind_at)
            .bind(&req.payload)
            .bind(&req.channel)
            .bind(&req.external_key)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            return Ok(row.0);
        }

        sqlx::query(
            "INSERT INTO reminders (id, user_id, memory_id, remind_at, payload, channel) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(req.user_id)
        .bind(req.memory_id)
        .bind(req.remind_at)
        .bind(&req.payload)
        .bind(&req.channel)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(id)
    }

    /// Due and unsent reminders: `remind_at <= before AND sent_at IS NULL`.
    pub async fn pending(
        &self,
        user_id: Option<Uuid>,
        before: DateTime<Utc>,
    ) -> Result<Vec<Reminder>, RepositoryError> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query(
                    "SELECT id, user_id, memory_id, remind_at, payload, channel, sent_at \
                     FROM reminders WHERE user_id = $1 AND sent_at IS NULL AND remind_at <= $2 \
                     ORDER BY remind_at",
                )
                .bind(user_id)
                .bind(before)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, user_id, memory_id, remind_at, payload, channel, sent_at \
                     FROM reminders WHERE sent_at IS NULL AND remind_at <= $1 \
                     ORDER BY remind_at",
                )
                .bind(before)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_err)?;

        rows.iter().map(row_to_reminder).collect()
    }

    /// Set `sent_at` exactly once. Calling again is a no-op, which makes
    /// the dispatcher's at-least-once delivery safe.
    pub async fn mark_sent(&self, id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE reminders SET sent_at = now() WHERE id = $1 AND sent_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        if result.rows_affected() == 0 {
            // Either already sent (fine) or unknown. Distinguish so a bad
            // id still surfaces.
            let exists: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM reminders WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_err)?;
            if exists.is_none() {
                return Err(RepositoryError::NotFound);
            }
        }
        Ok(())
    }

    /// Users that still have unsent reminders (dispatcher discovery).
    pub async fn user_ids_with_pending(&self) -> Result<Vec<Uuid>, RepositoryError> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT DISTINCT user_id FROM reminders WHERE sent_at IS NULL")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

fn row_to_reminder(row: &PgRow) -> Result<Reminder, RepositoryError> {
    Ok(Reminder {
        id: row.try_get("id").map_err(map_err)?,
        user_id: row.try_get("user_id").map_err(map_err)?,
        memory_id: row.try_get("memory_id").map_err(map_err)?,
        remind_at: row.try_get("remind_at").map_err(map_err)?,
        payload: row.try_get("payload").map_err(map_err)?,
        channel: row.try_get("channel").map_err(map_err)?,
        sent_at: row.try_get("sent_at").map_err(map_err)?,
    })
}

fn map_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}

/// Parse the `remind_at` argument of a `schedule_reminder` call.
pub fn parse_remind_at(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    extract::parse_timestamp(raw)
        .ok_or_else(|| RepositoryError::Query(format!("invalid remind_at '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remind_at_formats() {
        assert_eq!(
            parse_remind_at("2025-10-18T01:00:00Z").unwrap().to_rfc3339(),
            "2025-10-18T01:00:00+00:00"
        );
        assert_eq!(
            parse_remind_at("2025-10-18T09:00:00+08:00").unwrap().to_rfc3339(),
            "2025-10-18T01:00:00+00:00"
        );
        assert!(parse_remind_at("明天九点").is_err());
    }
}
