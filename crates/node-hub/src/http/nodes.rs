use super::*;
use axum::routing::{delete, get, post};
use common::api::{
    ApiUrlPayload, BatchUpdateRequest, BatchUpdateResponse, BroadcastApiUrlRequest,
    BroadcastResponse, CommandAction, NodeCommand, NodeStatusResponse, OnlineNodeSummary,
    UpdateNodeResponse,
};
use std::collections::HashSet;
use tower_http::limit::RequestBodyLimitLayer;

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/nodes/online", get(online_nodes))
        .route("/api/v1/nodes/{node_id}/status", get(node_status))
        .route(
            "/api/v1/nodes/{node_id}/connection",
            delete(disconnect_node),
        )
        .route(
            "/api/v1/nodes/api-url",
            post(broadcast_api_url).layer(RequestBodyLimitLayer::new(OPERATOR_BODY_LIMIT)),
        )
        .route("/api/v1/nodes/{node_id}/update", post(update_node))
        .route(
            "/api/v1/nodes/update",
            post(update_nodes).layer(RequestBodyLimitLayer::new(OPERATOR_BODY_LIMIT)),
        )
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}

async fn online_nodes(State(state): State<AppState>) -> Json<Vec<OnlineNodeSummary>> {
    Json(state.registry.online_nodes().await)
}

async fn node_status(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
) -> ApiResult<Json<NodeStatusResponse>> {
    state
        .status
        .latest(node_id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no status reported by node {node_id}")))
}

#[derive(Debug, Serialize)]
struct DisconnectResponse {
    node_id: i64,
    disconnected: bool,
}

async fn disconnect_node(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
) -> Json<DisconnectResponse> {
    let disconnected = state.registry.unregister(node_id).await;
    if disconnected {
        info!(node_id, "operator closed node session");
    }
    Json(DisconnectResponse {
        node_id,
        disconnected,
    })
}

async fn broadcast_api_url(
    State(state): State<AppState>,
    Json(req): Json<BroadcastApiUrlRequest>,
) -> ApiResult<Json<BroadcastResponse>> {
    let api_url = req.api_url.trim();
    if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
        return Err(AppError::bad_request(
            "api_url must be an absolute http(s) URL",
        ));
    }

    let command = NodeCommand::new(CommandAction::ApiUrlChange(ApiUrlPayload {
        api_url: api_url.to_string(),
    }));
    let filter: Option<HashSet<i64>> = req.node_ids.map(|ids| ids.into_iter().collect());
    let outcome = state
        .registry
        .broadcast_command(&command, |node_id| {
            filter.as_ref().map_or(true, |ids| ids.contains(&node_id))
        })
        .await?;

    info!(
        command_id = %command.command_id,
        notified = outcome.notified,
        online = outcome.online,
        "api url change broadcast"
    );
    Ok(Json(BroadcastResponse {
        notified: outcome.notified,
        online: outcome.online,
    }))
}

async fn update_node(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
) -> ApiResult<Json<UpdateNodeResponse>> {
    Ok(Json(state.updates.trigger(node_id).await?))
}

async fn update_nodes(
    State(state): State<AppState>,
    Json(req): Json<BatchUpdateRequest>,
) -> ApiResult<Json<BatchUpdateResponse>> {
    Ok(Json(state.updates.trigger_batch(&req).await?))
}
