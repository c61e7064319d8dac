use std::{collections::HashMap, sync::RwLock};

use chrono::{DateTime, Utc};
use common::api::NodeStatusResponse;
use serde_json::value::RawValue;
use tracing::warn;

/// Accepts opaque status payloads keyed by node id.
pub trait StatusSink: Send + Sync {
    fn record(&self, node_id: i64, payload: Box<RawValue>);
}

struct StoredStatus {
    received_at: DateTime<Utc>,
    payload: Box<RawValue>,
}

/// Latest status report per node.
#[derive(Default)]
pub struct StatusStore {
    latest: RwLock<HashMap<i64, StoredStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, node_id: i64) -> Option<NodeStatusResponse> {
        let guard = self
            .latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stored = guard.get(&node_id)?;
        match serde_json::from_str(stored.payload.get()) {
            Ok(status) => Some(NodeStatusResponse {
                node_id,
                received_at: stored.received_at,
                status,
            }),
            Err(err) => {
                warn!(node_id, error = %err, "stored status payload is not valid json");
                None
            }
        }
    }

    pub fn forget(&self, node_id: i64) {
        self.latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&node_id);
    }
}

impl StatusSink for StatusStore {
    fn record(&self, node_id: i64, payload: Box<RawValue>) {
        let stored = StoredStatus {
            received_at: Utc::now(),
            payload,
        };
        self.latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node_id, stored);
    }
}
