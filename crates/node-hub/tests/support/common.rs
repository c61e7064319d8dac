#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request as HttpRequest, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use node_hub::{
    app_state::AppState,
    config::{
        AppConfig, DatabaseConfig, MetricsConfig, OperatorAuthConfig, ReleaseConfig,
        ServerConfig, TokenConfig,
    },
    metrics::{init_metrics_recorder, record_build_info},
    persistence as db,
    persistence::{migrations, nodes, subscriptions, NewNode, NewSubscription, SubscriptionStatus},
    releases::GithubReleaseSource,
    routes::{build_metrics_router, build_router},
    tokens::hash_token,
};
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const TEST_OPERATOR_TOKEN: &str = "test-operator-token";
pub const TEST_PEPPER: &str = "test-pepper";

pub fn test_config(release_api_base: &str) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        metrics: MetricsConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        database: DatabaseConfig {
            url: "sqlite::memory:".into(),
        },
        operator: OperatorAuthConfig {
            tokens: vec![TEST_OPERATOR_TOKEN.into()],
            header_name: "authorization".into(),
        },
        tokens: TokenConfig {
            pepper: TEST_PEPPER.into(),
        },
        hub: Default::default(),
        traffic: Default::default(),
        quota: Default::default(),
        releases: ReleaseConfig {
            github_repo: "acme/node-agent".into(),
            api_base: release_api_base.trim_end_matches('/').to_string(),
            asset_prefix: "node-agent".into(),
            cache_ttl_secs: 600,
            batch_max_nodes: 1000,
        },
    }
}

/// Fully wired state over a fresh database. Releases are looked up at
/// `release_api_base`, usually an httpmock server.
pub async fn setup_state(release_api_base: &str) -> AppState {
    setup_state_with(test_config(release_api_base)).await
}

pub async fn setup_state_with(config: AppConfig) -> AppState {
    let pool = migrations::init_pool(&config.database.url)
        .await
        .expect("pool");
    let outcome = migrations::run_migrations(&pool).await.expect("migrations");
    let metrics_handle = init_metrics_recorder();
    record_build_info(&outcome.snapshot);
    let releases = Arc::new(GithubReleaseSource::new(&config.releases).expect("release source"));

    AppState::assemble(pool, &config, releases, metrics_handle, outcome.snapshot)
        .expect("assemble state")
}

pub fn api_app(state: &AppState) -> Router {
    build_router(state.clone()).with_state(state.clone())
}

pub fn metrics_app(state: &AppState) -> Router {
    build_metrics_router(state.clone()).with_state(state.clone())
}

/// Serve the API router on an ephemeral port; returns the bound address.
pub async fn serve(state: &AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = api_app(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    addr
}

pub async fn create_node(pool: &db::Db, name: &str, token: &str) -> i64 {
    nodes::create_node(
        pool,
        NewNode {
            name: name.into(),
            token_hash: hash_token(token, TEST_PEPPER),
        },
    )
    .await
    .expect("create node")
    .id
}

pub async fn create_subscription(pool: &db::Db, sid: &str, traffic_limit: i64) -> i64 {
    let now = Utc::now();
    subscriptions::create_subscription(
        pool,
        NewSubscription {
            sid: sid.into(),
            plan_type: "monthly".into(),
            traffic_limit,
            period_start: now - ChronoDuration::days(1),
            period_end: now + ChronoDuration::days(29),
            status: SubscriptionStatus::Active,
        },
    )
    .await
    .expect("create subscription")
    .id
}

pub fn operator_request(
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_OPERATOR_TOKEN}"));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

pub async fn send(app: &Router, req: HttpRequest<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(req).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, json)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
