use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite};

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Inactive,
}

#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRecord {
    pub id: i64,
    pub sid: String,
    pub plan_type: String,
    pub traffic_limit: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: SubscriptionStatus,
    pub suspended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub sid: String,
    pub plan_type: String,
    pub traffic_limit: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: SubscriptionStatus,
}

pub async fn create_subscription(pool: &Db, new: NewSubscription) -> Result<SubscriptionRecord> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO subscriptions (
            sid, plan_type, traffic_limit, period_start, period_end, status,
            created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        "#,
    )
    .bind(&new.sid)
    .bind(&new.plan_type)
    .bind(new.traffic_limit)
    .bind(new.period_start)
    .bind(new.period_end)
    .bind(new.status)
    .bind(now)
    .execute(pool)
    .await?;

    get_subscription(pool, result.last_insert_rowid())
        .await?
        .ok_or_else(|| anyhow::anyhow!("subscription insert did not return row"))
}

pub async fn get_subscription(pool: &Db, id: i64) -> Result<Option<SubscriptionRecord>> {
    let record = sqlx::query_as::<_, SubscriptionRecord>(
        r#"
        SELECT id, sid, plan_type, traffic_limit, period_start, period_end, status, suspended_at
        FROM subscriptions
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Map SIDs to ids; inactive subscriptions do not resolve.
pub async fn resolve_sids(pool: &Db, sids: &[String]) -> Result<HashMap<String, i64>> {
    if sids.is_empty() {
        return Ok(HashMap::new());
    }
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT sid, id FROM subscriptions WHERE status IN ('active', 'suspended') AND sid IN (",
    );
    let mut separated = builder.separated(", ");
    for sid in sids {
        separated.push_bind(sid.as_str());
    }
    separated.push_unseparated(")");
    let rows: Vec<(String, i64)> = builder.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().collect())
}

/// Flip an active subscription to suspended. Returns false when nothing changed.
pub async fn mark_suspended(pool: &Db, id: i64) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = 'suspended', suspended_at = ?1, updated_at = ?1
        WHERE id = ?2 AND status = 'active'
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::{init_pool, run_migrations};
    use chrono::Duration;

    fn new_subscription(sid: &str, status: SubscriptionStatus) -> NewSubscription {
        let now = Utc::now();
        NewSubscription {
            sid: sid.into(),
            plan_type: "node".into(),
            traffic_limit: 1_000,
            period_start: now - Duration::days(1),
            period_end: now + Duration::days(29),
            status,
        }
    }

    #[tokio::test]
    async fn resolve_skips_inactive_and_unknown() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let active = create_subscription(&pool, new_subscription("sid-a", SubscriptionStatus::Active))
            .await
            .unwrap();
        let suspended =
            create_subscription(&pool, new_subscription("sid-s", SubscriptionStatus::Suspended))
                .await
                .unwrap();
        create_subscription(&pool, new_subscription("sid-i", SubscriptionStatus::Inactive))
            .await
            .unwrap();

        let resolved = resolve_sids(
            &pool,
            &["sid-a".into(), "sid-s".into(), "sid-i".into(), "sid-x".into()],
        )
        .await
        .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["sid-a"], active.id);
        assert_eq!(resolved["sid-s"], suspended.id);
    }

    #[tokio::test]
    async fn mark_suspended_is_idempotent() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let sub = create_subscription(&pool, new_subscription("sid-a", SubscriptionStatus::Active))
            .await
            .unwrap();

        assert!(mark_suspended(&pool, sub.id).await.unwrap());
        assert!(!mark_suspended(&pool, sub.id).await.unwrap());
        let stored = get_subscription(&pool, sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Suspended);
        assert!(stored.suspended_at.is_some());
    }
}
