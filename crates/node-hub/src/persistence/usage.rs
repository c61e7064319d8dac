use chrono::{DateTime, Utc};

use super::Db;
use crate::{buffer::TrafficDelta, Result};

/// Persist one drained buffer batch atomically.
pub async fn insert_usage_batch(
    pool: &Db,
    deltas: &[TrafficDelta],
    recorded_at: DateTime<Utc>,
) -> Result<usize> {
    if deltas.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    for delta in deltas {
        sqlx::query(
            r#"
            INSERT INTO traffic_usage (node_id, subscription_id, upload, download, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(delta.node_id)
        .bind(delta.subscription_id)
        .bind(delta.upload)
        .bind(delta.download)
        .bind(recorded_at.timestamp())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(deltas.len())
}

/// Upload plus download bytes recorded in `[period_start, period_end)`.
pub async fn period_usage(
    pool: &Db,
    subscription_id: i64,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<i64> {
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(upload + download), 0)
        FROM traffic_usage
        WHERE subscription_id = ?1 AND recorded_at >= ?2 AND recorded_at < ?3
        "#,
    )
    .bind(subscription_id)
    .bind(period_start.timestamp())
    .bind(period_end.timestamp())
    .fetch_one(pool)
    .await?;
    Ok(total)
}
