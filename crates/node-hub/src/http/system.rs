use super::*;
use axum::routing::get;

pub fn api_router() -> Router<AppState> {
    Router::<AppState>::new().route("/health", get(healthz))
}

pub fn metrics_router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new().route(
        "/metrics",
        get(metrics).route_layer(middleware::from_fn_with_state(state, require_operator_auth)),
    )
}
