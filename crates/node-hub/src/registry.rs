use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use common::api::{NodeCommand, OnlineNodeSummary};
use metrics::gauge;
use tokio::{
    sync::{mpsc, watch, RwLock},
    time::Instant,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::telemetry;

/// Live node -> session map; the only authority on whether a node is online.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<i64, NodeConnection>>>,
    queue_capacity: usize,
}

struct NodeConnection {
    conn_id: Uuid,
    outbound: mpsc::Sender<String>,
    closing: Arc<watch::Sender<Option<CloseReason>>>,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    last_pong: Instant,
}

impl NodeConnection {
    /// First reason wins; later signals are ignored.
    fn retire(&self, reason: CloseReason) {
        self.closing.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

/// Ownership half handed to the session pumps on registration.
pub struct SessionHandle {
    pub node_id: i64,
    pub conn_id: Uuid,
    pub outbound: mpsc::Receiver<String>,
    pub closing: Arc<watch::Sender<Option<CloseReason>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer session for the same node registered.
    Replaced,
    /// Explicitly removed through the registry.
    Unregistered,
    PongTimeout,
    RemoteClosed,
    TransportError,
    FrameTooLarge,
    WriteFailed,
    QueueClosed,
    /// The hub is stopping.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Replaced => "replaced",
            CloseReason::Unregistered => "unregistered",
            CloseReason::PongTimeout => "pong_timeout",
            CloseReason::RemoteClosed => "remote_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::FrameTooLarge => "frame_too_large",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::QueueClosed => "queue_closed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("node is not connected")]
    NotConnected,
    #[error("node outbound queue is full")]
    QueueFull,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastOutcome {
    pub notified: usize,
    pub online: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Install a session for `node_id`, retiring any previous one first.
    ///
    /// The old entry is removed and signalled under the same write lock that
    /// installs the new entry, so no reader ever observes two sessions.
    pub async fn register(&self, node_id: i64, remote_addr: Option<SocketAddr>) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_capacity);
        let (closing, _) = watch::channel(None);
        let closing = Arc::new(closing);
        let conn_id = Uuid::new_v4();

        let mut guard = self.inner.write().await;
        if let Some(previous) = guard.remove(&node_id) {
            previous.retire(CloseReason::Replaced);
            info!(
                node_id,
                previous_conn = %previous.conn_id,
                new_conn = %conn_id,
                "replacing existing node session"
            );
        }
        guard.insert(
            node_id,
            NodeConnection {
                conn_id,
                outbound: outbound_tx,
                closing: closing.clone(),
                remote_addr,
                connected_at: Utc::now(),
                last_pong: Instant::now(),
            },
        );
        gauge!("node_hub_sessions").set(guard.len() as f64);

        SessionHandle {
            node_id,
            conn_id,
            outbound: outbound_rx,
            closing,
        }
    }

    /// Remove whatever session `node_id` has. Returns false when none existed.
    pub async fn unregister(&self, node_id: i64) -> bool {
        let mut guard = self.inner.write().await;
        let Some(conn) = guard.remove(&node_id) else {
            return false;
        };
        conn.retire(CloseReason::Unregistered);
        gauge!("node_hub_sessions").set(guard.len() as f64);
        true
    }

    /// Remove the entry only if it still belongs to `conn_id`.
    pub(crate) async fn release(&self, node_id: i64, conn_id: Uuid) -> bool {
        let mut guard = self.inner.write().await;
        match guard.get(&node_id) {
            Some(conn) if conn.conn_id == conn_id => {}
            _ => return false,
        }
        guard.remove(&node_id);
        gauge!("node_hub_sessions").set(guard.len() as f64);
        true
    }

    /// Retire every live session. Returns how many were signalled.
    pub async fn close_all(&self) -> usize {
        let mut guard = self.inner.write().await;
        let closed = guard.len();
        for (_, conn) in guard.drain() {
            conn.retire(CloseReason::Shutdown);
        }
        gauge!("node_hub_sessions").set(0.0);
        closed
    }

    pub async fn is_online(&self, node_id: i64) -> bool {
        self.inner.read().await.contains_key(&node_id)
    }

    pub async fn connection_id(&self, node_id: i64) -> Option<Uuid> {
        self.inner.read().await.get(&node_id).map(|c| c.conn_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Queue a frame without waiting; a full queue is reported, never awaited.
    pub async fn send_to(&self, node_id: i64, frame: String) -> Result<(), DispatchError> {
        let guard = self.inner.read().await;
        let Some(conn) = guard.get(&node_id) else {
            telemetry::record_dispatch("not_connected");
            return Err(DispatchError::NotConnected);
        };
        match conn.outbound.try_send(frame) {
            Ok(()) => {
                telemetry::record_dispatch("ok");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                telemetry::record_dispatch("queue_full");
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                telemetry::record_dispatch("not_connected");
                Err(DispatchError::NotConnected)
            }
        }
    }

    pub async fn send_command(
        &self,
        node_id: i64,
        command: &NodeCommand,
    ) -> Result<(), DispatchError> {
        let frame = serde_json::to_string(command)?;
        self.send_to(node_id, frame).await
    }

    /// Offer `frame` to every online node accepted by `predicate`.
    pub async fn broadcast<F>(&self, frame: &str, predicate: F) -> BroadcastOutcome
    where
        F: Fn(i64) -> bool,
    {
        let guard = self.inner.read().await;
        let mut outcome = BroadcastOutcome {
            notified: 0,
            online: guard.len(),
        };
        for (node_id, conn) in guard.iter() {
            if !predicate(*node_id) {
                continue;
            }
            match conn.outbound.try_send(frame.to_string()) {
                Ok(()) => {
                    telemetry::record_dispatch("ok");
                    outcome.notified += 1;
                }
                Err(err) => {
                    let result = match err {
                        mpsc::error::TrySendError::Full(_) => "queue_full",
                        mpsc::error::TrySendError::Closed(_) => "not_connected",
                    };
                    telemetry::record_dispatch(result);
                    debug!(node_id = *node_id, result, "broadcast skipped node");
                }
            }
        }
        outcome
    }

    pub async fn broadcast_command<F>(
        &self,
        command: &NodeCommand,
        predicate: F,
    ) -> Result<BroadcastOutcome, DispatchError>
    where
        F: Fn(i64) -> bool,
    {
        let frame = serde_json::to_string(command)?;
        Ok(self.broadcast(&frame, predicate).await)
    }

    pub(crate) async fn touch_pong(&self, node_id: i64, conn_id: Uuid) {
        let mut guard = self.inner.write().await;
        if let Some(conn) = guard.get_mut(&node_id) {
            if conn.conn_id == conn_id {
                conn.last_pong = Instant::now();
            }
        }
    }

    pub async fn online_nodes(&self) -> Vec<OnlineNodeSummary> {
        let guard = self.inner.read().await;
        let now = Instant::now();
        let mut nodes: Vec<OnlineNodeSummary> = guard
            .iter()
            .map(|(node_id, conn)| OnlineNodeSummary {
                node_id: *node_id,
                remote_addr: conn.remote_addr.map(|addr| addr.to_string()),
                connected_at: conn.connected_at,
                last_pong_secs: now.saturating_duration_since(conn.last_pong).as_secs(),
            })
            .collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }
}
