use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::quota::{CachedQuotaInfo, QuotaCache};

struct Entry {
    info: CachedQuotaInfo,
    expires_at: Instant,
}

/// In-process quota cache with separate lifetimes for hits and not-found markers.
pub struct QuotaTtlCache {
    entries: Mutex<HashMap<i64, Entry>>,
    ttl: Duration,
    not_found_ttl: Duration,
}

impl QuotaTtlCache {
    pub fn new(ttl: Duration, not_found_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            not_found_ttl,
        }
    }

    pub fn insert(&self, subscription_id: i64, info: CachedQuotaInfo) {
        let ttl = if info.not_found {
            self.not_found_ttl
        } else {
            self.ttl
        };
        let entry = Entry {
            info,
            expires_at: Instant::now() + ttl,
        };
        self.lock().insert(subscription_id, entry);
    }

    pub fn insert_not_found(&self, subscription_id: i64) {
        self.insert(subscription_id, CachedQuotaInfo::not_found_marker());
    }

    pub fn invalidate(&self, subscription_id: i64) {
        self.lock().remove(&subscription_id);
    }

    fn lookup(&self, subscription_id: i64) -> Option<CachedQuotaInfo> {
        let mut entries = self.lock();
        match entries.get(&subscription_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.info.clone()),
            Some(_) => {
                entries.remove(&subscription_id);
                None
            }
            None => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Entry>> {
        // Entries are plain data; a poisoned lock still holds a usable map.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QuotaCache for QuotaTtlCache {
    async fn get(&self, subscription_id: i64) -> anyhow::Result<Option<CachedQuotaInfo>> {
        Ok(self.lookup(subscription_id))
    }

    async fn mark_suspended(&self, subscription_id: i64) -> anyhow::Result<()> {
        let mut entries = self.lock();
        match entries.get_mut(&subscription_id) {
            Some(entry) if !entry.info.not_found => {
                entry.info.suspended = true;
                Ok(())
            }
            _ => anyhow::bail!("no cached quota for subscription {subscription_id}"),
        }
    }
}
