use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    buffer::TrafficBuffer,
    cache::QuotaTtlCache,
    persistence::{self as db, subscriptions as subscription_store, usage as usage_store},
    quota::{CachedQuotaInfo, PlanType, QuotaLoader, SuspensionEnforcer, UsageReader},
    traffic::SubscriptionResolver,
};

pub struct SqliteSubscriptionResolver {
    db: db::Db,
}

impl SqliteSubscriptionResolver {
    pub fn new(db: db::Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubscriptionResolver for SqliteSubscriptionResolver {
    async fn resolve(&self, sids: &[String]) -> anyhow::Result<HashMap<String, i64>> {
        subscription_store::resolve_sids(&self.db, sids).await
    }
}

/// Loads quota rows on cache miss and stores the result, including not-found markers.
pub struct CachingQuotaLoader {
    db: db::Db,
    cache: Arc<QuotaTtlCache>,
}

impl CachingQuotaLoader {
    pub fn new(db: db::Db, cache: Arc<QuotaTtlCache>) -> Self {
        Self { db, cache }
    }
}

#[async_trait]
impl QuotaLoader for CachingQuotaLoader {
    async fn load(&self, subscription_id: i64) -> anyhow::Result<Option<CachedQuotaInfo>> {
        let record = subscription_store::get_subscription(&self.db, subscription_id).await?;
        let Some(record) = record.filter(|r| r.status != db::SubscriptionStatus::Inactive) else {
            self.cache.insert_not_found(subscription_id);
            return Ok(None);
        };
        let Some(plan_type) = PlanType::parse(&record.plan_type) else {
            warn!(subscription_id, plan_type = %record.plan_type, "unknown plan type; treating as absent");
            self.cache.insert_not_found(subscription_id);
            return Ok(None);
        };

        let info = CachedQuotaInfo {
            traffic_limit: record.traffic_limit,
            period_start: record.period_start,
            period_end: record.period_end,
            plan_type,
            suspended: record.status == db::SubscriptionStatus::Suspended,
            not_found: false,
        };
        self.cache.insert(subscription_id, info.clone());
        Ok(Some(info))
    }
}

/// Flushed usage from the database plus counters still sitting in the buffer.
pub struct BufferedUsageReader {
    db: db::Db,
    buffer: Arc<TrafficBuffer>,
}

impl BufferedUsageReader {
    pub fn new(db: db::Db, buffer: Arc<TrafficBuffer>) -> Self {
        Self { db, buffer }
    }
}

#[async_trait]
impl UsageReader for BufferedUsageReader {
    async fn period_usage(
        &self,
        subscription_id: i64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        // Database first: a flush committing between the two reads can only undercount.
        let flushed =
            usage_store::period_usage(&self.db, subscription_id, period_start, period_end).await?;
        let now = Utc::now();
        let pending = if now >= period_start && now < period_end {
            self.buffer.pending_for(subscription_id)
        } else {
            0
        };
        Ok(flushed.saturating_add(pending))
    }
}

pub struct SqliteSuspensionEnforcer {
    db: db::Db,
}

impl SqliteSuspensionEnforcer {
    pub fn new(db: db::Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SuspensionEnforcer for SqliteSuspensionEnforcer {
    async fn suspend(&self, subscription_id: i64) -> anyhow::Result<()> {
        if subscription_store::mark_suspended(&self.db, subscription_id).await? {
            info!(subscription_id, "subscription suspended for exceeding traffic quota");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{
        migrations::{init_pool, run_migrations},
        subscriptions::{create_subscription, get_subscription, NewSubscription},
        SubscriptionStatus,
    };
    use crate::quota::QuotaCache;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    async fn db() -> db::Db {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    async fn subscription(pool: &db::Db, sid: &str, status: SubscriptionStatus) -> i64 {
        let now = Utc::now();
        create_subscription(
            pool,
            NewSubscription {
                sid: sid.into(),
                plan_type: "hybrid".into(),
                traffic_limit: 500,
                period_start: now - ChronoDuration::days(1),
                period_end: now + ChronoDuration::days(1),
                status,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn cache() -> Arc<QuotaTtlCache> {
        Arc::new(QuotaTtlCache::new(
            Duration::from_secs(300),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn loader_caches_hits_and_markers() {
        let pool = db().await;
        let active = subscription(&pool, "sid-a", SubscriptionStatus::Active).await;
        let inactive = subscription(&pool, "sid-i", SubscriptionStatus::Inactive).await;
        let cache = cache();
        let loader = CachingQuotaLoader::new(pool, cache.clone());

        let info = loader.load(active).await.unwrap().expect("active quota");
        assert_eq!(info.plan_type, PlanType::Hybrid);
        assert_eq!(info.traffic_limit, 500);
        assert_eq!(cache.get(active).await.unwrap(), Some(info));

        assert!(loader.load(inactive).await.unwrap().is_none());
        assert!(cache.get(inactive).await.unwrap().unwrap().not_found);
        assert!(loader.load(9_999).await.unwrap().is_none());
        assert!(cache.get(9_999).await.unwrap().unwrap().not_found);
    }

    #[tokio::test]
    async fn usage_reader_includes_unflushed_buffer() {
        let pool = db().await;
        let sub = subscription(&pool, "sid-a", SubscriptionStatus::Active).await;
        let buffer = Arc::new(TrafficBuffer::new());
        usage_store::insert_usage_batch(
            &pool,
            &[crate::buffer::TrafficDelta {
                node_id: 1,
                subscription_id: sub,
                upload: 100,
                download: 50,
            }],
            Utc::now(),
        )
        .await
        .unwrap();
        buffer.add(2, sub, 7, 3);

        let reader = BufferedUsageReader::new(pool, buffer);
        let now = Utc::now();
        let used = reader
            .period_usage(sub, now - ChronoDuration::days(1), now + ChronoDuration::days(1))
            .await
            .unwrap();
        assert_eq!(used, 160);
    }

    #[tokio::test]
    async fn usage_reader_counts_counters_mid_flush() {
        let pool = db().await;
        let sub = subscription(&pool, "sid-a", SubscriptionStatus::Active).await;
        let buffer = Arc::new(TrafficBuffer::new());
        buffer.add(1, sub, 300, 200);
        let reader = BufferedUsageReader::new(pool.clone(), buffer.clone());
        let now = Utc::now();
        let (start, end) = (now - ChronoDuration::days(1), now + ChronoDuration::days(1));

        let batch = buffer.begin_flush();
        assert_eq!(reader.period_usage(sub, start, end).await.unwrap(), 500);

        usage_store::insert_usage_batch(&pool, &batch, now).await.unwrap();
        buffer.commit_flush();
        assert_eq!(reader.period_usage(sub, start, end).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn enforcer_suspends_in_database() {
        let pool = db().await;
        let sub = subscription(&pool, "sid-a", SubscriptionStatus::Active).await;
        let enforcer = SqliteSuspensionEnforcer::new(pool.clone());
        enforcer.suspend(sub).await.unwrap();
        enforcer.suspend(sub).await.unwrap();
        let stored = get_subscription(&pool, sub).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Suspended);
    }
}
