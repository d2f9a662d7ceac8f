//! Principal and channel-binding store.

use serde_json::Value;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use hearth_types::error::RepositoryError;
use hearth_types::principal::principal_id_for_key;

#[derive(Clone)]
pub struct PrincipalStore {
    pool: PgPool,
}

impl PrincipalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensure a principal row exists for a key and return its id.
    pub async fn ensure_principal(&self, key: &str) -> Result<Uuid, RepositoryError> {
        let id = principal_id_for_key(key);
        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(id)
    }

    /// Resolve a channel address to its bound principal, creating the
    /// binding (and the principal) on first contact.
    pub async fn resolve_channel(
        &self,
        channel: &str,
        channel_user_id: &str,
        channel_data: Option<&Value>,
    ) -> Result<Uuid, RepositoryError> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM user_channels WHERE channel = $1 AND channel_user_id = $2",
        )
        .bind(channel)
        .bind(channel_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        if let Some((user_id,)) = existing {
            return Ok(user_id);
        }

        let user_id = self
            .ensure_principal(&format!("{channel}:{channel_user_id}"))
            .await?;
        sqlx::query(
            "INSERT INTO user_channels (user_id, channel, channel_user_id, channel_data, is_primary) \
             VALUES ($1, $2, $3, COALESCE($4, '{}'::jsonb), true) \
             ON CONFLICT (channel, channel_user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(channel)
        .bind(channel_user_id)
        .bind(channel_data)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(user_id)
    }

    /// Ensure the configured family principal set exists (called once at
    /// startup so the tool service's foreign keys hold).
    pub async fn ensure_many(&self, ids: &[Uuid]) -> Result<(), RepositoryError> {
        for id in ids {
            sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }
}

fn map_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}
