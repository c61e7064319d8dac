use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::buffer::TrafficBuffer;
use crate::persistence::{self as db, usage as usage_store};
use crate::Result;

/// Periodically move buffered traffic counters into `traffic_usage`.
///
/// Runs until `shutdown` flips to `true` (or its sender is dropped), then
/// flushes one last time.
pub async fn traffic_flush_loop(
    db: db::Db,
    buffer: Arc<TrafficBuffer>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match flush_traffic(&db, &buffer, Utc::now()).await {
                    Ok(0) => {}
                    Ok(rows) => debug!(rows, "flushed traffic usage"),
                    Err(err) => warn!(?err, pending = buffer.len(), "traffic flush failed; counters requeued"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    match flush_traffic(&db, &buffer, Utc::now()).await {
        Ok(rows) => info!(rows, "final traffic flush complete"),
        Err(err) => warn!(?err, pending = buffer.len(), "final traffic flush failed"),
    }
}

/// Write the buffer in one transaction. Counters leave the buffer only after
/// the commit; on failure they go back to the open set.
pub(crate) async fn flush_traffic(
    db: &db::Db,
    buffer: &TrafficBuffer,
    now: DateTime<Utc>,
) -> Result<usize> {
    let deltas = buffer.begin_flush();
    if deltas.is_empty() {
        return Ok(0);
    }
    match usage_store::insert_usage_batch(db, &deltas, now).await {
        Ok(rows) => {
            buffer.commit_flush();
            Ok(rows)
        }
        Err(err) => {
            buffer.abort_flush();
            Err(err)
        }
    }
}
