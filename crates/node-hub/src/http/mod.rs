use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::info;

use crate::{
    app_state::AppState,
    auth::require_operator_auth,
    error::{ApiResult, AppError},
    metrics::HttpMetricsLayer,
};

mod agents;
mod error_mapper;
mod nodes;
mod system;

pub(crate) const AGENT_VERSION_HEADER: &str = "x-agent-version";
pub(crate) const AGENT_PLATFORM_HEADER: &str = "x-agent-platform";
pub(crate) const AGENT_ARCH_HEADER: &str = "x-agent-arch";

/// Operator request bodies are small JSON documents.
const OPERATOR_BODY_LIMIT: usize = 64 * 1024;

pub fn build_router(state: AppState) -> Router<AppState> {
    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(HttpMetricsLayer);
    Router::<AppState>::new()
        .merge(system::api_router())
        .merge(agents::router())
        .merge(nodes::router(state))
        .layer(middleware_stack)
}

pub fn build_metrics_router(state: AppState) -> Router<AppState> {
    system::metrics_router(state)
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub built_at: &'static str,
    pub schema_version: Option<i64>,
    pub online_nodes: usize,
    pub buffered_counters: usize,
}

pub(crate) async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: crate::version::VERSION,
        git_sha: crate::version::GIT_SHA,
        built_at: crate::version::BUILD_TIMESTAMP,
        schema_version: state.schema.latest_applied,
        online_nodes: state.registry.len().await,
        buffered_counters: state.buffer.len(),
    })
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
