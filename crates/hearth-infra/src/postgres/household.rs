//! Household view loader with a short-TTL process cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use hearth_core::household::HouseholdDirectory;
use hearth_types::error::{EngineError, RepositoryError};
use hearth_types::household::{Household, HouseholdMember, HouseholdView};

/// Household structure changes rarely; 60 s keeps the scope resolver off
/// the database on every message.
const CACHE_TTL: Duration = Duration::from_secs(60);

pub struct CachedHouseholdDirectory {
    pool: PgPool,
    family_user_ids: Vec<Uuid>,
    cache: Mutex<Option<(Arc<HouseholdView>, Instant)>>,
}

impl CachedHouseholdDirectory {
    pub fn new(pool: PgPool, family_user_ids: Vec<Uuid>) -> Self {
        Self {
            pool,
            family_user_ids,
            cache: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<HouseholdView, RepositoryError> {
        let started = Instant::now();

        let household_rows = sqlx::query(
            "SELECT id, slug, display_name, description, config FROM households ORDER BY slug",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let households: Vec<Household> = household_rows
            .iter()
            .map(|row| {
                Ok(Household {
                    id: row.try_get("id").map_err(map_err)?,
                    slug: row.try_get("slug").map_err(map_err)?,
                    display_name: row.try_get("display_name").map_err(map_err)?,
                    description: row.try_get("description").map_err(map_err)?,
                    config: row
                        .try_get::<Value, _>("config")
                        .unwrap_or(Value::Object(Default::default())),
                })
            })
            .collect::<Result<_, RepositoryError>>()?;

        let member_rows = sqlx::query(
            "SELECT m.member_key, m.display_name, m.role, m.life_status, m.profile, \
                    COALESCE(array_agg(a.user_id) FILTER (WHERE a.user_id IS NOT NULL), '{}') AS user_ids \
             FROM family_members m \
             LEFT JOIN family_member_accounts a ON a.member_id = m.id \
             WHERE m.is_active \
             GROUP BY m.id \
             ORDER BY m.member_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut members = Vec::with_capacity(member_rows.len());
        let mut members_index = BTreeMap::new();
        let mut family_scope: Vec<Uuid> = self.family_user_ids.clone();

        for row in &member_rows {
            let member = HouseholdMember {
                member_key: row.try_get("member_key").map_err(map_err)?,
                display_name: row.try_get("display_name").map_err(map_err)?,
                role: row.try_get("role").map_err(map_err)?,
                life_status: row.try_get("life_status").map_err(map_err)?,
                profile: row
                    .try_get::<Value, _>("profile")
                    .unwrap_or(Value::Object(Default::default())),
                user_ids: row.try_get::<Vec<Uuid>, _>("user_ids").unwrap_or_default(),
            };
            for id in &member.user_ids {
                if !family_scope.contains(id) {
                    family_scope.push(*id);
                }
            }
            members_index.insert(member.member_key.clone(), member.clone());
            members.push(member);
        }

        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            households = households.len(),
            members = members.len(),
            "household view refreshed"
        );

        Ok(HouseholdView {
            households,
            members,
            members_index,
            family_scope_user_ids: family_scope,
        })
    }
}

impl HouseholdDirectory for CachedHouseholdDirectory {
    async fn view(&self) -> Result<HouseholdView, EngineError> {
        {
            let cache = self.cache.lock().await;
            if let Some((view, refreshed_at)) = cache.as_ref() {
                if refreshed_at.elapsed() < CACHE_TTL {
                    debug!("household view cache hit");
                    return Ok(view.as_ref().clone());
                }
            }
        }

        let view = self.load().await.map_err(EngineError::from)?;
        let mut cache = self.cache.lock().await;
        *cache = Some((Arc::new(view.clone()), Instant::now()));
        Ok(view)
    }
}

fn map_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}
