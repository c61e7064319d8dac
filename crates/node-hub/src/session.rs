use std::{fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::HubConfig,
    registry::{CloseReason, ConnectionRegistry},
    router::{MessageRouter, RouteOutcome},
    telemetry,
};

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_frame_bytes: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&HubConfig> for SessionLimits {
    fn from(cfg: &HubConfig) -> Self {
        Self {
            max_frame_bytes: cfg.max_frame_bytes,
            ping_interval: cfg.ping_interval(),
            pong_timeout: cfg.pong_timeout(),
            write_timeout: cfg.write_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub node_id: i64,
    pub conn_id: Uuid,
    pub reason: CloseReason,
    pub frames_received: u64,
    pub state: SessionState,
}

type CloseSignal = Arc<watch::Sender<Option<CloseReason>>>;

/// Drives one node connection: a write pump task plus the read pump.
#[derive(Clone)]
pub struct ConnectionSession {
    registry: ConnectionRegistry,
    router: Arc<MessageRouter>,
    limits: SessionLimits,
}

impl ConnectionSession {
    pub fn new(
        registry: ConnectionRegistry,
        router: Arc<MessageRouter>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            registry,
            router,
            limits,
        }
    }

    /// Run the session until either pump hits a terminal condition.
    ///
    /// The registry entry is released and the transport closed exactly once,
    /// after which the write pump is awaited.
    pub async fn run<S, R, E>(
        &self,
        node_id: i64,
        remote_addr: Option<SocketAddr>,
        sink: S,
        stream: R,
    ) -> SessionSummary
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let mut state = SessionState::Connecting;
        let handle = self.registry.register(node_id, remote_addr).await;
        let conn_id = handle.conn_id;
        let closing = handle.closing;
        transition(node_id, &mut state, SessionState::Open);
        info!(node_id, %conn_id, remote = ?remote_addr, "node session opened");

        let writer = tokio::spawn(write_pump(
            node_id,
            sink,
            handle.outbound,
            closing.clone(),
            self.limits,
        ));

        let (read_reason, frames_received) =
            self.read_pump(node_id, conn_id, stream, &closing).await;

        transition(node_id, &mut state, SessionState::Closing);
        signal_close(&closing, read_reason);
        let reason = (*closing.borrow()).unwrap_or(read_reason);
        let released = self.registry.release(node_id, conn_id).await;
        if writer.await.is_err() {
            warn!(node_id, %conn_id, "write pump terminated abnormally");
        }
        transition(node_id, &mut state, SessionState::Closed);

        telemetry::record_session_closed(reason.as_str());
        info!(
            node_id,
            %conn_id,
            reason = reason.as_str(),
            released,
            frames_received,
            "node session closed"
        );
        SessionSummary {
            node_id,
            conn_id,
            reason,
            frames_received,
            state,
        }
    }

    async fn read_pump<R, E>(
        &self,
        node_id: i64,
        conn_id: Uuid,
        mut stream: R,
        closing: &CloseSignal,
    ) -> (CloseReason, u64)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let mut closed = closing.subscribe();
        let mut deadline = Instant::now() + self.limits.pong_timeout;
        let mut frames = 0u64;

        loop {
            if let Some(reason) = *closed.borrow_and_update() {
                return (reason, frames);
            }

            let next = tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        return (CloseReason::QueueClosed, frames);
                    }
                    continue;
                }
                next = time::timeout_at(deadline, stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    info!(node_id, %conn_id, "no pong within timeout; closing session");
                    return (CloseReason::PongTimeout, frames);
                }
                Ok(None) => return (CloseReason::RemoteClosed, frames),
                Ok(Some(Err(err))) => {
                    debug!(node_id, %conn_id, error = %err, "transport error on node session");
                    return (CloseReason::TransportError, frames);
                }
                Ok(Some(Ok(message))) => message,
            };
            frames += 1;

            match message {
                Message::Pong(_) => {
                    deadline = Instant::now() + self.limits.pong_timeout;
                    self.registry.touch_pong(node_id, conn_id).await;
                }
                Message::Ping(_) => {}
                Message::Close(frame) => {
                    debug!(node_id, %conn_id, ?frame, "node closed session");
                    return (CloseReason::RemoteClosed, frames);
                }
                Message::Text(text) => {
                    if text.len() > self.limits.max_frame_bytes {
                        warn!(node_id, %conn_id, size = text.len(), "inbound frame exceeds limit");
                        return (CloseReason::FrameTooLarge, frames);
                    }
                    if self.router.route(node_id, text.as_str()).await == RouteOutcome::Heartbeat {
                        deadline = Instant::now() + self.limits.pong_timeout;
                        self.registry.touch_pong(node_id, conn_id).await;
                    }
                }
                Message::Binary(data) => {
                    if data.len() > self.limits.max_frame_bytes {
                        warn!(node_id, %conn_id, size = data.len(), "inbound frame exceeds limit");
                        return (CloseReason::FrameTooLarge, frames);
                    }
                    warn!(node_id, %conn_id, "skipping unsupported binary frame");
                }
            }
        }
    }
}

async fn write_pump<S>(
    node_id: i64,
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    closing: CloseSignal,
    limits: SessionLimits,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut closed = closing.subscribe();
    let mut keepalive = time::interval_at(Instant::now() + limits.ping_interval, limits.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if closed.borrow_and_update().is_some() {
            break;
        }
        let message = tokio::select! {
            biased;
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    // Traffic on the queue stands in for a ping.
                    keepalive.reset();
                    Message::Text(frame.into())
                }
                None => {
                    signal_close(&closing, CloseReason::QueueClosed);
                    break;
                }
            },
            _ = keepalive.tick() => Message::Ping(Bytes::new()),
        };

        match time::timeout(limits.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(node_id, error = %err, "write to node failed");
                signal_close(&closing, CloseReason::WriteFailed);
                break;
            }
            Err(_) => {
                warn!(node_id, "write to node timed out");
                signal_close(&closing, CloseReason::WriteFailed);
                break;
            }
        }
    }

    let _ = time::timeout(limits.write_timeout, sink.send(Message::Close(None))).await;
    let _ = time::timeout(limits.write_timeout, sink.close()).await;
}

fn signal_close(closing: &CloseSignal, reason: CloseReason) {
    closing.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

fn transition(node_id: i64, state: &mut SessionState, next: SessionState) {
    debug!(node_id, from = ?*state, to = ?next, "session state change");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{test_router, RecordingSink, RecordingStatus};
    use futures_util::{sink, stream};
    use std::convert::Infallible;

    type Inbound = Result<Message, Infallible>;

    fn limits() -> SessionLimits {
        SessionLimits::from(&HubConfig::default())
    }

    fn session(registry: &ConnectionRegistry) -> (ConnectionSession, Arc<RecordingStatus>) {
        let status = Arc::new(RecordingStatus::default());
        let router = Arc::new(test_router(
            status.clone(),
            Arc::new(RecordingSink::default()),
        ));
        (
            ConnectionSession::new(registry.clone(), router, limits()),
            status,
        )
    }

    /// Sink that forwards every written message into a channel.
    fn capture_sink() -> (
        std::pin::Pin<Box<dyn Sink<Message, Error = Infallible> + Send>>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, message: Message| async move {
            let _ = tx.send(message);
            Ok::<_, Infallible>(tx)
        });
        (Box::pin(sink), rx)
    }

    fn inbound() -> (
        mpsc::UnboundedSender<Inbound>,
        std::pin::Pin<Box<dyn Stream<Item = Inbound> + Send>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel::<Inbound>();
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, Box::pin(stream))
    }

    async fn wait_online(registry: &ConnectionRegistry, node_id: i64) {
        while !registry.is_online(node_id).await {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_dropped_after_pong_timeout() {
        let registry = ConnectionRegistry::new(8);
        let (session, _) = session(&registry);
        let (sink, _sent) = capture_sink();

        let started = Instant::now();
        let summary = session
            .run(1, None, sink, stream::pending::<Inbound>())
            .await;

        assert_eq!(summary.reason, CloseReason::PongTimeout);
        assert_eq!(summary.state, SessionState::Closed);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(!registry.is_online(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_the_session_alive_and_pings_are_sent() {
        let registry = ConnectionRegistry::new(8);
        let (session, _) = session(&registry);
        let (sink, mut sent) = capture_sink();
        let (tx, stream) = inbound();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.run(2, None, sink, stream).await }
        });
        wait_online(&registry, 2).await;

        for _ in 0..4 {
            time::sleep(Duration::from_secs(30)).await;
            tx.send(Ok(Message::Pong(Bytes::new()))).expect("send pong");
        }
        assert!(registry.is_online(2).await, "pongs refresh the read deadline");

        let mut pings = 0;
        while let Ok(message) = sent.try_recv() {
            if matches!(message, Message::Ping(_)) {
                pings += 1;
            }
        }
        assert!(pings >= 3, "expected keepalive pings, saw {pings}");

        drop(tx);
        let summary = task.await.expect("session task");
        assert_eq!(summary.reason, CloseReason::RemoteClosed);
    }

    #[tokio::test]
    async fn queued_frames_are_written_in_order() {
        let registry = ConnectionRegistry::new(8);
        let (session, _) = session(&registry);
        let (sink, mut sent) = capture_sink();
        let (tx, stream) = inbound();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.run(3, None, sink, stream).await }
        });
        wait_online(&registry, 3).await;

        registry.send_to(3, "first".into()).await.expect("queue");
        registry.send_to(3, "second".into()).await.expect("queue");

        let mut texts = Vec::new();
        while texts.len() < 2 {
            if let Some(Message::Text(text)) = sent.recv().await {
                texts.push(text.to_string());
            }
        }
        assert_eq!(texts, vec!["first", "second"]);

        tx.send(Ok(Message::Close(None))).expect("close");
        let summary = task.await.expect("session task");
        assert_eq!(summary.reason, CloseReason::RemoteClosed);
        assert!(!registry.is_online(3).await);
    }

    #[tokio::test]
    async fn malformed_frames_do_not_end_the_session() {
        let registry = ConnectionRegistry::new(8);
        let (session, status) = session(&registry);
        let (sink, _sent) = capture_sink();
        let frames: Vec<Inbound> = vec![
            Ok(Message::Text("garbage".into())),
            Ok(Message::Text(r#"{"type":"future_thing"}"#.into())),
            Ok(Message::Binary(Bytes::from_static(b"\x00\x01"))),
            Ok(Message::Text(r#"{"type":"status","data":{"ok":true}}"#.into())),
        ];

        let summary = session.run(4, None, sink, stream::iter(frames)).await;

        assert_eq!(summary.reason, CloseReason::RemoteClosed);
        assert_eq!(summary.frames_received, 4);
        assert_eq!(status.recorded(), vec![(4, r#"{"ok":true}"#.to_string())]);
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_session() {
        let registry = ConnectionRegistry::new(8);
        let (session, _) = session(&registry);
        let (sink, _sent) = capture_sink();
        let big = "x".repeat(limits().max_frame_bytes + 1);
        let frames: Vec<Inbound> = vec![Ok(Message::Text(big.into()))];

        let summary = session
            .run(5, None, sink, stream::iter(frames).chain(stream::pending()))
            .await;
        assert_eq!(summary.reason, CloseReason::FrameTooLarge);
    }

    #[tokio::test]
    async fn replacement_retires_old_session_without_touching_new_one() {
        let registry = ConnectionRegistry::new(8);
        let (session, _) = session(&registry);
        let (sink, _sent) = capture_sink();

        let task = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .run(6, None, sink, stream::pending::<Inbound>())
                    .await
            }
        });
        wait_online(&registry, 6).await;

        let replacement = registry.register(6, None).await;
        let summary = task.await.expect("session task");

        assert_eq!(summary.reason, CloseReason::Replaced);
        assert_eq!(registry.connection_id(6).await, Some(replacement.conn_id));
    }

    #[tokio::test]
    async fn write_failure_tears_down_session() {
        let registry = ConnectionRegistry::new(8);
        let (session, _) = session(&registry);
        let failing = Box::pin(sink::unfold((), |_, _message: Message| async move {
            Err::<(), _>("broken pipe")
        }));

        let task = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .run(7, None, failing, stream::pending::<Inbound>())
                    .await
            }
        });
        wait_online(&registry, 7).await;
        registry.send_to(7, "hello".into()).await.expect("queued");

        let summary = task.await.expect("session task");
        assert_eq!(summary.reason, CloseReason::WriteFailed);
        assert!(!registry.is_online(7).await);
    }
}
