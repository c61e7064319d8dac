use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::traffic::TrafficSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficDelta {
    pub node_id: i64,
    pub subscription_id: i64,
    pub upload: i64,
    pub download: i64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    upload: i64,
    download: i64,
}

#[derive(Default)]
struct Counts {
    open: HashMap<(i64, i64), Counters>,
    /// Taken by a flush that has not committed yet.
    in_flight: HashMap<(i64, i64), Counters>,
}

fn merge(into: &mut HashMap<(i64, i64), Counters>, key: (i64, i64), upload: i64, download: i64) {
    let entry = into.entry(key).or_default();
    entry.upload = entry.upload.saturating_add(upload);
    entry.download = entry.download.saturating_add(download);
}

/// Accumulates per (node, subscription) byte counters between flushes.
///
/// A flush is two-phase: [`begin_flush`](Self::begin_flush) moves the open
/// counters in flight, then [`commit_flush`](Self::commit_flush) forgets them
/// or [`abort_flush`](Self::abort_flush) puts them back. In-flight counters
/// still count towards [`pending_for`](Self::pending_for) until committed.
#[derive(Default)]
pub struct TrafficBuffer {
    counts: Mutex<Counts>,
}

impl TrafficBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node_id: i64, subscription_id: i64, upload: i64, download: i64) {
        merge(&mut self.lock().open, (node_id, subscription_id), upload, download);
    }

    /// Move every open counter in flight and return the whole in-flight set.
    pub fn begin_flush(&self) -> Vec<TrafficDelta> {
        let mut counts = self.lock();
        let open = std::mem::take(&mut counts.open);
        for (key, c) in open {
            merge(&mut counts.in_flight, key, c.upload, c.download);
        }
        let mut deltas: Vec<TrafficDelta> = counts
            .in_flight
            .iter()
            .map(|(&(node_id, subscription_id), c)| TrafficDelta {
                node_id,
                subscription_id,
                upload: c.upload,
                download: c.download,
            })
            .collect();
        deltas.sort_by_key(|d| (d.node_id, d.subscription_id));
        deltas
    }

    /// The in-flight counters are in the database now.
    pub fn commit_flush(&self) {
        self.lock().in_flight.clear();
    }

    /// Merge the in-flight counters back after a failed flush.
    pub fn abort_flush(&self) {
        let mut counts = self.lock();
        let in_flight = std::mem::take(&mut counts.in_flight);
        for (key, c) in in_flight {
            merge(&mut counts.open, key, c.upload, c.download);
        }
    }

    /// Unflushed upload+download bytes for one subscription across all nodes.
    pub fn pending_for(&self, subscription_id: i64) -> i64 {
        let counts = self.lock();
        counts
            .open
            .iter()
            .chain(counts.in_flight.iter())
            .filter(|((_, sub), _)| *sub == subscription_id)
            .fold(0i64, |acc, (_, c)| {
                acc.saturating_add(c.upload).saturating_add(c.download)
            })
    }

    /// Open (node, subscription) counters waiting for the next flush.
    pub fn len(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        let counts = self.lock();
        counts.open.is_empty() && counts.in_flight.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TrafficSink for TrafficBuffer {
    async fn add(
        &self,
        node_id: i64,
        subscription_id: i64,
        upload: i64,
        download: i64,
    ) -> anyhow::Result<()> {
        TrafficBuffer::add(self, node_id, subscription_id, upload, download);
        Ok(())
    }
}
