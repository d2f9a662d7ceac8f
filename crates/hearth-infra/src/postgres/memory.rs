//! Memory store: the Postgres surface behind `store` / `search` /
//! `aggregate` / `update_memory_fields` / `soft_delete`.
//!
//! Queries are built with `QueryBuilder` so the filter grammar composes
//! without string interpolation of user data. The SQL builders are pure
//! functions, unit-tested without a database; only the thin `execute`
//! wrappers touch the pool.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::{Map, Value, json};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use hearth_types::error::RepositoryError;
use hearth_types::memory::MemoryRecord;
use hearth_types::tool::{AggregateOp, GroupBy, SearchFilters};

use super::extract;

const SELECT_COLUMNS: &str = "id, user_id, content, ai_understanding, \
     amount::float8 AS amount, value::float8 AS value, occurred_at, \
     type, thread_id, category, person, created_at, updated_at";

/// A `search` call after service-level validation.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub user_ids: Vec<Uuid>,
    pub query: Option<String>,
    pub query_embedding: Option<Vec<f32>>,
    pub filters: SearchFilters,
}

/// An `aggregate` call after service-level validation.
#[derive(Debug, Clone)]
pub struct AggregateRequest {
    pub user_ids: Vec<Uuid>,
    pub op: AggregateOp,
    pub field: Option<String>,
    pub filters: SearchFilters,
    pub group_by: Option<GroupBy>,
    pub group_by_ai_field: Option<String>,
}

/// A `store` call after service-level validation.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub user_id: Uuid,
    pub content: String,
    pub ai_data: Value,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOutcome {
    pub id: Uuid,
    /// True when an existing `(user_id, external_id)` record was merged
    /// instead of a new row inserted.
    pub updated: bool,
}

#[derive(Clone)]
pub struct MemoryStore {
    pool: PgPool,
}

impl MemoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a memory, or merge into the existing record when
    /// `ai_data.external_id` matches one (soft upsert). Runs in one
    /// transaction so concurrent imports of the same external id serialize
    /// on the row lock.
    pub async fn store(&self, req: &StoreRequest) -> Result<StoreOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let outcome = store_in_tx(&mut tx, req).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(outcome)
    }

    /// Store several memories in one transaction, so observers never see a
    /// partial batch.
    pub async fn store_batch(
        &self,
        reqs: &[StoreRequest],
    ) -> Result<Vec<StoreOutcome>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let mut outcomes = Vec::with_capacity(reqs.len());
        for req in reqs {
            outcomes.push(store_in_tx(&mut tx, req).await?);
        }
        tx.commit().await.map_err(map_err)?;
        Ok(outcomes)
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<Vec<MemoryRecord>, RepositoryError> {
        let mut qb = build_search_query(req)?;
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn aggregate(&self, req: &AggregateRequest) -> Result<Value, RepositoryError> {
        let mut qb = build_aggregate_query(req)?;

        if req.group_by.is_some() || req.group_by_ai_field.is_some() {
            let rows = qb.build().fetch_all(&self.pool).await.map_err(map_err)?;
            let groups: Vec<Value> = rows
                .iter()
                .map(|row| {
                    let bucket: Option<String> = row.try_get("bucket").ok();
                    let bucket_ts: Option<DateTime<Utc>> = row.try_get("bucket").ok();
                    let value: Option<f64> = row.try_get("value").ok().flatten();
                    json!({
                        "bucket": bucket_ts.map(|t| t.to_rfc3339()).or(bucket),
                        "value": value,
                    })
                })
                .collect();
            return Ok(json!(groups));
        }

        let row = qb.build().fetch_one(&self.pool).await.map_err(map_err)?;
        if req.op == AggregateOp::Count {
            let count: i64 = row.try_get("value").map_err(map_err)?;
            return Ok(json!(count));
        }
        let value: Option<f64> = row.try_get("value").map_err(map_err)?;
        Ok(match value {
            Some(v) => json!(v),
            None => req.op.empty_result(),
        })
    }

    /// Shallow-merge `fields` into `ai_understanding` and refresh the
    /// coerced columns, in one transaction. Returns the merged document.
    pub async fn update_fields(&self, id: Uuid, fields: &Value) -> Result<Value, RepositoryError> {
        if !fields.is_object() {
            return Err(RepositoryError::Query("fields must be an object".to_string()));
        }
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let merged: Option<(Value,)> = sqlx::query_as(
            "UPDATE memories SET ai_understanding = ai_understanding || $1, updated_at = now() \
             WHERE id = $2 RETURNING ai_understanding",
        )
        .bind(fields)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        let (merged,) = merged.ok_or(RepositoryError::NotFound)?;
        refresh_physical(&mut tx, id, &merged).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(merged)
    }

    /// Soft delete: flip `ai_understanding.deleted`. Never removes rows.
    pub async fn soft_delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.update_fields(id, &json!({"deleted": true})).await?;
        Ok(())
    }
}

async fn store_in_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    req: &StoreRequest,
) -> Result<StoreOutcome, RepositoryError> {
    if req.content.is_empty() {
        return Err(RepositoryError::Query("content must not be empty".to_string()));
    }

    let external_id = req.ai_data.get("external_id").and_then(Value::as_str);
    if let Some(external_id) = external_id {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM memories WHERE user_id = $1 AND external_id = $2 FOR UPDATE",
        )
        .bind(req.user_id)
        .bind(external_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_err)?;

        if let Some((id,)) = existing {
            let (merged,): (Value,) = sqlx::query_as(
                "UPDATE memories \
                 SET ai_understanding = ai_understanding || $1, content = $2, updated_at = now() \
                 WHERE id = $3 RETURNING ai_understanding",
            )
            .bind(&req.ai_data)
            .bind(&req.content)
            .bind(id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_err)?;

            refresh_physical(tx, id, &merged).await?;
            if let Some(embedding) = &req.embedding {
                sqlx::query("UPDATE memories SET embedding = $1 WHERE id = $2")
                    .bind(Vector::from(embedding.clone()))
                    .bind(id)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_err)?;
            }
            return Ok(StoreOutcome { id, updated: true });
        }
    }

    let id = Uuid::now_v7();
    sqlx::query(
        "INSERT INTO memories (id, user_id, content, ai_understanding, embedding, amount, value, occurred_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(id)
    .bind(req.user_id)
    .bind(&req.content)
    .bind(&req.ai_data)
    .bind(req.embedding.clone().map(Vector::from))
    .bind(extract::coerce_amount(&req.ai_data))
    .bind(extract::coerce_value(&req.ai_data))
    .bind(extract::coerce_occurred_at(&req.ai_data))
    .execute(&mut **tx)
    .await
    .map_err(map_err)?;

    Ok(StoreOutcome { id, updated: false })
}

/// Re-derive the coerced numeric/timestamp columns after a JSONB merge.
/// (The text columns are generated and refresh themselves.)
async fn refresh_physical(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    id: Uuid,
    merged: &Value,
) -> Result<(), RepositoryError> {
    sqlx::query("UPDATE memories SET amount = $1, value = $2, occurred_at = $3 WHERE id = $4")
        .bind(extract::coerce_amount(merged))
        .bind(extract::coerce_value(merged))
        .bind(extract::coerce_occurred_at(merged))
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(map_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Query builders (pure, unit-tested)
// ---------------------------------------------------------------------------

fn build_search_query(req: &SearchRequest) -> Result<QueryBuilder<'static, Postgres>, RepositoryError> {
    let mut qb = QueryBuilder::new(format!("SELECT {SELECT_COLUMNS} FROM memories WHERE "));
    push_conditions(&mut qb, &req.user_ids, &req.filters)?;

    match (&req.query_embedding, &req.query) {
        (Some(embedding), _) => {
            qb.push(" ORDER BY embedding <=> ");
            qb.push_bind(Vector::from(embedding.clone()));
            qb.push(" NULLS LAST");
        }
        (None, Some(query)) if !query.is_empty() => {
            qb.push(" ORDER BY similarity(content, ");
            qb.push_bind(query.clone());
            qb.push(") DESC NULLS LAST, occurred_at DESC NULLS LAST");
        }
        _ => {
            qb.push(" ORDER BY occurred_at DESC NULLS LAST, created_at DESC");
        }
    }

    qb.push(" LIMIT ");
    qb.push_bind(req.filters.effective_limit());
    Ok(qb)
}

fn build_aggregate_query(
    req: &AggregateRequest,
) -> Result<QueryBuilder<'static, Postgres>, RepositoryError> {
    let value_expr = aggregate_expr(req.op, req.field.as_deref())?;

    let mut qb = QueryBuilder::new("SELECT ");
    match (&req.group_by, &req.group_by_ai_field) {
        (Some(bucket), _) => {
            qb.push(format!(
                "date_trunc('{}', occurred_at) AS bucket, ",
                bucket.date_trunc_unit()
            ));
            qb.push(format!("{value_expr} AS value FROM memories WHERE occurred_at IS NOT NULL AND "));
            push_conditions(&mut qb, &req.user_ids, &req.filters)?;
            qb.push(" GROUP BY bucket ORDER BY bucket");
        }
        (None, Some(ai_field)) => {
            if !is_safe_json_key(ai_field) {
                return Err(RepositoryError::Query(format!(
                    "invalid group_by_ai_field '{ai_field}'"
                )));
            }
            qb.push("ai_understanding ->> ");
            qb.push_bind(ai_field.clone());
            qb.push(format!(" AS bucket, {value_expr} AS value FROM memories WHERE "));
            push_conditions(&mut qb, &req.user_ids, &req.filters)?;
            qb.push(" GROUP BY bucket ORDER BY bucket");
        }
        (None, None) => {
            qb.push(format!("{value_expr} AS value FROM memories WHERE "));
            push_conditions(&mut qb, &req.user_ids, &req.filters)?;
        }
    }
    Ok(qb)
}

/// The aggregate expression for an operation over a field, which may be a
/// physicalized numeric column or a numeric JSONB path.
fn aggregate_expr(op: AggregateOp, field: Option<&str>) -> Result<String, RepositoryError> {
    if op == AggregateOp::Count {
        return Ok("COUNT(*)".to_string());
    }
    let field = field.unwrap_or("amount");
    let inner = match field {
        "amount" => "amount::float8".to_string(),
        "value" => "value::float8".to_string(),
        path if is_safe_json_path(path) => {
            format!("(ai_understanding #>> '{{{}}}')::float8", path.replace('.', ","))
        }
        other => {
            return Err(RepositoryError::Query(format!(
                "invalid aggregate field '{other}'"
            )));
        }
    };
    Ok(format!("{}({inner})", op.sql_function()))
}

/// WHERE clause shared by search and aggregate.
fn push_conditions(
    qb: &mut QueryBuilder<'static, Postgres>,
    user_ids: &[Uuid],
    filters: &SearchFilters,
) -> Result<(), RepositoryError> {
    match user_ids.len() {
        0 => {
            return Err(RepositoryError::Query("user_id is required".to_string()));
        }
        1 => {
            qb.push("user_id = ");
            qb.push_bind(user_ids[0]);
        }
        _ => {
            qb.push("user_id = ANY(");
            qb.push_bind(user_ids.to_vec());
            qb.push(")");
        }
    }

    if let Some(id) = filters.id {
        qb.push(" AND id = ");
        qb.push_bind(id);
    }
    if let Some(record_type) = &filters.record_type {
        qb.push(" AND type = ");
        qb.push_bind(record_type.clone());
    }
    if let Some(thread_id) = &filters.thread_id {
        qb.push(" AND thread_id = ");
        qb.push_bind(thread_id.clone());
    }
    if let Some(category) = &filters.category {
        qb.push(" AND category = ");
        qb.push_bind(category.clone());
    }
    if let Some(person) = &filters.person {
        qb.push(" AND person = ");
        qb.push_bind(person.clone());
    }
    if let Some(channel) = &filters.channel {
        qb.push(" AND ai_understanding ->> 'channel' = ");
        qb.push_bind(channel.clone());
    }
    if let Some(date_from) = &filters.date_from {
        let ts = extract::parse_timestamp(date_from)
            .ok_or_else(|| RepositoryError::Query(format!("invalid date_from '{date_from}'")))?;
        qb.push(" AND occurred_at >= ");
        qb.push_bind(ts);
    }
    if let Some(date_to) = &filters.date_to {
        let ts = extract::parse_timestamp(date_to)
            .ok_or_else(|| RepositoryError::Query(format!("invalid date_to '{date_to}'")))?;
        qb.push(" AND occurred_at <= ");
        qb.push_bind(ts);
    }
    if let Some(amount_min) = filters.amount_min {
        qb.push(" AND amount >= ");
        qb.push_bind(amount_min);
    }
    if let Some(amount_max) = filters.amount_max {
        qb.push(" AND amount <= ");
        qb.push_bind(amount_max);
    }
    if let Some(jsonb_equals) = &filters.jsonb_equals {
        qb.push(" AND ai_understanding @> ");
        qb.push_bind(Value::Object(jsonb_equals.clone()));
    }
    // Soft-deleted records stay hidden unless explicitly requested.
    if !filters.deleted.unwrap_or(false) {
        qb.push(" AND NOT COALESCE((ai_understanding ->> 'deleted')::boolean, false)");
    }
    Ok(())
}

fn is_safe_json_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_safe_json_path(path: &str) -> bool {
    !path.is_empty() && path.split('.').all(is_safe_json_key)
}

fn row_to_record(row: &PgRow) -> Result<MemoryRecord, RepositoryError> {
    let record = MemoryRecord {
        id: row.try_get("id").map_err(map_err)?,
        user_id: row.try_get("user_id").map_err(map_err)?,
        content: row.try_get("content").map_err(map_err)?,
        ai_understanding: row
            .try_get::<Value, _>("ai_understanding")
            .unwrap_or(Value::Object(Map::new())),
        amount: row.try_get("amount").map_err(map_err)?,
        value: row.try_get("value").map_err(map_err)?,
        occurred_at: row.try_get("occurred_at").map_err(map_err)?,
        record_type: row.try_get("type").map_err(map_err)?,
        thread_id: row.try_get("thread_id").map_err(map_err)?,
        category: row.try_get("category").map_err(map_err)?,
        person: row.try_get("person").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
        updated_at: row.try_get("updated_at").map_err(map_err)?,
    };
    Ok(record)
}

fn map_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_with_filters(filters: SearchFilters) -> SearchRequest {
        SearchRequest {
            user_ids: vec![Uuid::now_v7()],
            query: None,
            query_embedding: None,
            filters,
        }
    }

    #[test]
    fn test_search_sql_default_ordering() {
        let qb = build_search_query(&req_with_filters(SearchFilters::default())).unwrap();
        let sql = qb.sql();
        assert!(sql.contains("ORDER BY occurred_at DESC NULLS LAST, created_at DESC"));
        assert!(sql.contains("NOT COALESCE((ai_understanding ->> 'deleted')::boolean, false)"));
        assert!(sql.contains("LIMIT"));
    }

    #[test]
    fn test_search_sql_vector_ordering_wins() {
        let mut req = req_with_filters(SearchFilters::default());
        req.query = Some("买菜".to_string());
        req.query_embedding = Some(vec![0.1; 4]);
        let qb = build_search_query(&req).unwrap();
        let sql = qb.sql();
        assert!(sql.contains("embedding <=>"));
        assert!(!sql.contains("similarity(content"));
    }

    #[test]
    fn test_search_sql_trigram_fallback() {
        let mut req = req_with_filters(SearchFilters::default());
        req.query = Some("买菜".to_string());
        let qb = build_search_query(&req).unwrap();
        assert!(qb.sql().contains("similarity(content"));
    }

    #[test]
    fn test_search_sql_many_users_uses_any() {
        let req = SearchRequest {
            user_ids: vec![Uuid::now_v7(), Uuid::now_v7()],
            ..Default::default()
        };
        let qb = build_search_query(&req).unwrap();
        assert!(qb.sql().contains("user_id = ANY("));
    }

    #[test]
    fn test_search_sql_all_filters() {
        let filters: SearchFilters = serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "type": "expense",
            "thread_id": "t-1",
            "category": "food",
            "person": "jack",
            "channel": "threema",
            "date_from": "2025-10-01",
            "date_to": "2025-10-31",
            "amount_min": 1,
            "amount_max": 1000,
            "jsonb_equals": {"period": "2025-10"}
        }))
        .unwrap();
        let qb = build_search_query(&req_with_filters(filters)).unwrap();
        let sql = qb.sql();
        for fragment in [
            "id =",
            "type =",
            "thread_id =",
            "category =",
            "person =",
            "ai_understanding ->> 'channel'",
            "occurred_at >=",
            "occurred_at <=",
            "amount >=",
            "amount <=",
            "ai_understanding @>",
        ] {
            assert!(sql.contains(fragment), "missing {fragment} in {sql}");
        }
    }

    #[test]
    fn test_search_sql_deleted_override() {
        let filters = SearchFilters {
            deleted: Some(true),
            ..Default::default()
        };
        let qb = build_search_query(&req_with_filters(filters)).unwrap();
        assert!(!qb.sql().contains("'deleted'"));
    }

    #[test]
    fn test_search_requires_user_id() {
        let req = SearchRequest::default();
        assert!(build_search_query(&req).is_err());
    }

    #[test]
    fn test_invalid_date_filter_is_an_error() {
        let filters = SearchFilters {
            date_from: Some("not a date".to_string()),
            ..Default::default()
        };
        assert!(build_search_query(&req_with_filters(filters)).is_err());
    }

    #[test]
    fn test_aggregate_expr_variants() {
        assert_eq!(aggregate_expr(AggregateOp::Count, None).unwrap(), "COUNT(*)");
        assert_eq!(
            aggregate_expr(AggregateOp::Sum, None).unwrap(),
            "SUM(amount::float8)"
        );
        assert_eq!(
            aggregate_expr(AggregateOp::Avg, Some("value")).unwrap(),
            "AVG(value::float8)"
        );
        assert_eq!(
            aggregate_expr(AggregateOp::Max, Some("metrics.weight")).unwrap(),
            "MAX((ai_understanding #>> '{metrics,weight}')::float8)"
        );
        assert!(aggregate_expr(AggregateOp::Sum, Some("amount; DROP TABLE")).is_err());
    }

    #[test]
    fn test_aggregate_sql_group_by_month() {
        let req = AggregateRequest {
            user_ids: vec![Uuid::now_v7()],
            op: AggregateOp::Sum,
            field: None,
            filters: SearchFilters::default(),
            group_by: Some(GroupBy::Month),
            group_by_ai_field: None,
        };
        let qb = build_aggregate_query(&req).unwrap();
        let sql = qb.sql();
        assert!(sql.contains("date_trunc('month', occurred_at)"));
        assert!(sql.contains("GROUP BY bucket ORDER BY bucket"));
    }

    #[test]
    fn test_aggregate_sql_group_by_ai_field() {
        let req = AggregateRequest {
            user_ids: vec![Uuid::now_v7()],
            op: AggregateOp::Sum,
            field: None,
            filters: SearchFilters::default(),
            group_by: None,
            group_by_ai_field: Some("category".to_string()),
        };
        let qb = build_aggregate_query(&req).unwrap();
        assert!(qb.sql().contains("ai_understanding ->>"));

        let bad = AggregateRequest {
            group_by_ai_field: Some("cat; --".to_string()),
            ..req
        };
        assert!(build_aggregate_query(&bad).is_err());
    }

    #[test]
    fn test_safe_json_path() {
        assert!(is_safe_json_path("amount"));
        assert!(is_safe_json_path("metrics.weight_kg"));
        assert!(!is_safe_json_path("metrics..weight"));
        assert!(!is_safe_json_path("a'b"));
        assert!(!is_safe_json_path(""));
    }
}
