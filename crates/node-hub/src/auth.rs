use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, Request},
    middleware::Next,
};
use tower_http::request_id::RequestId;
use tracing::warn;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    persistence::{nodes as node_store, NodeRecord},
    tokens::hash_token,
};

pub async fn require_operator_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map(str::to_string);

    let token = extract_bearer_from_header(
        req.headers(),
        &state.operator_auth.header_name,
        "operator authorization header",
    )
    .inspect_err(|err| {
        warn!(
            path = %req.uri().path(),
            ?request_id,
            reason = %err.message,
            "operator authentication failed"
        );
    })?;

    if !state.operator_auth.is_valid(&token) {
        warn!(path = %req.uri().path(), ?request_id, "invalid operator token");
        return Err(AppError::forbidden("invalid operator token"));
    }

    Ok(next.run(req).await)
}

/// Resolve the node behind an agent's bearer token.
pub async fn authenticate_node(state: &AppState, headers: &HeaderMap) -> ApiResult<NodeRecord> {
    let token = extract_bearer(headers)?;
    let token_hash = hash_token(&token, &state.token_pepper);
    node_store::find_by_token_hash(&state.db, &token_hash)
        .await?
        .ok_or_else(|| {
            warn!("agent presented an unknown node token");
            AppError::unauthorized("invalid node token")
        })
}

pub fn extract_bearer(headers: &HeaderMap) -> ApiResult<String> {
    extract_bearer_from_header(headers, &AUTHORIZATION, "authorization header")
}

pub fn extract_bearer_from_header(
    headers: &HeaderMap,
    header: &HeaderName,
    context: &str,
) -> ApiResult<String> {
    let value = headers
        .get(header)
        .ok_or_else(|| AppError::unauthorized(format!("missing {context}")))?;

    let value = value
        .to_str()
        .map_err(|_| AppError::unauthorized(format!("invalid {context}")))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::unauthorized(format!("invalid {context} scheme")))?
        .trim();
    if token.is_empty() {
        return Err(AppError::unauthorized(format!("empty {context}")));
    }

    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            extract_bearer(&headers).unwrap_err().message,
            "missing authorization header"
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(
            extract_bearer(&headers).unwrap_err().message,
            "invalid authorization header scheme"
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  "));
        assert!(extract_bearer(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer node-secret"));
        assert_eq!(extract_bearer(&headers).unwrap(), "node-secret");
    }

    #[tokio::test]
    async fn node_tokens_resolve_through_peppered_hash() {
        let state = crate::services::test_support::setup_state().await;
        let node = node_store::create_node(
            &state.db,
            crate::persistence::NewNode {
                name: "edge-1".into(),
                token_hash: hash_token("node-secret", &state.token_pepper),
            },
        )
        .await
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer node-secret".parse().unwrap());
        let found = authenticate_node(&state, &headers).await.unwrap();
        assert_eq!(found.id, node.id);

        headers.insert(AUTHORIZATION, "Bearer other".parse().unwrap());
        let err = authenticate_node(&state, &headers).await.unwrap_err();
        assert_eq!(err.code, "unauthorized");
    }
}
