use super::*;
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo,
    },
    routing::get,
};
use futures_util::StreamExt;
use tracing::warn;

use crate::{
    auth::authenticate_node,
    persistence::{nodes as node_store, AgentInfoUpdate},
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route("/api/v1/agent/ws", get(agent_ws))
}

/// Authenticate the agent, record what it says about itself, then hand the
/// upgraded socket to a session.
async fn agent_ws(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<axum::response::Response> {
    let node = authenticate_node(&state, &headers).await?;
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(node_id = node.id, %rejection, "agent endpoint called without websocket upgrade");
            return Ok(rejection.into_response());
        }
    };

    let agent = AgentInfoUpdate {
        version: header_value(&headers, AGENT_VERSION_HEADER),
        platform: header_value(&headers, AGENT_PLATFORM_HEADER).map(|v| v.to_ascii_lowercase()),
        arch: header_value(&headers, AGENT_ARCH_HEADER).map(|v| v.to_ascii_lowercase()),
    };
    if let Err(err) = node_store::record_agent_info(&state.db, node.id, &agent).await {
        warn!(node_id = node.id, ?err, "failed to record agent info");
    }

    let address = state.address.observe(node.id, remote_addr.ip()).await;
    info!(
        node_id = node.id,
        remote = %remote_addr,
        agent_version = agent.version.as_deref().unwrap_or("unknown"),
        address = ?address,
        "agent connecting"
    );

    let node_id = node.id;
    let sessions = state.sessions.clone();
    let max_frame = state.hub.max_frame_bytes;
    Ok(upgrade
        .max_frame_size(max_frame)
        .max_message_size(max_frame)
        .on_failed_upgrade(move |err| {
            warn!(node_id, error = %err, "agent websocket upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            sessions.run(node_id, Some(remote_addr), sink, stream).await;
        }))
}
