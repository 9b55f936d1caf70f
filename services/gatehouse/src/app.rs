//! HTTP surface for the auth endpoint.
//!
//! # Purpose
//! Adapts the decision pipeline to the reverse proxy's `auth_request`
//! contract: two body-less endpoints, where `200` means forward the request
//! and `407` means reject it. Nothing about a failure is ever written to
//! the response body.
use crate::auth::decision::Authenticator;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::get;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Headers probed, in order, for the forwarded bearer token.
const TOKEN_HEADERS: [&str; 2] = ["x-forwarded-proxy-authorization", "x-forwarded-authorization"];

/// The colon-form scheme is a deliberate part of the external contract.
const BEARER_PREFIX: &str = "bearer:";

#[derive(Clone)]
pub struct AppState {
    pub authenticator: Arc<Authenticator>,
    /// Name of the header carrying the original request URL.
    pub original_url_header: String,
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri()
            )
        });

    Router::new()
        .route("/auth", get(check_auth))
        .route("/healthz", get(healthz))
        .layer(trace_layer)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn check_auth(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let Some(token) = extract_bearer(&headers) else {
        tracing::debug!("missing or malformed forwarded authorization header");
        return deny();
    };
    let Some(raw_url) = headers
        .get(state.original_url_header.as_str())
        .and_then(|value| value.to_str().ok())
    else {
        tracing::debug!(header = %state.original_url_header, "missing original url header");
        return deny();
    };
    let original_url: Uri = match raw_url.parse() {
        Ok(uri) => uri,
        Err(err) => {
            tracing::debug!(error = %err, "failed to parse original url header");
            return deny();
        }
    };

    match state.authenticator.authorize(token, &original_url).await {
        Ok(principal) => {
            metrics::counter!("gatehouse_auth_decisions_total", "outcome" => "allow").increment(1);
            tracing::debug!(principal = %principal, url = %original_url, "request authorized");
            StatusCode::OK
        }
        Err(err) => {
            if err.logs_at_warn() {
                tracing::warn!(error = %err, url = %original_url, "request denied");
            } else {
                tracing::debug!(error = %err, url = %original_url, "request denied");
            }
            deny()
        }
    }
}

fn deny() -> StatusCode {
    metrics::counter!("gatehouse_auth_decisions_total", "outcome" => "deny").increment(1);
    StatusCode::PROXY_AUTHENTICATION_REQUIRED
}

/// First non-empty of the forwarded authorization headers, stripped of the
/// `Bearer:` scheme. Matching is case-insensitive and at most one space is
/// tolerated after the colon; any further whitespace is malformed.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let raw = TOKEN_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
    })?;
    strip_bearer(raw)
}

fn strip_bearer(raw: &str) -> Option<&str> {
    if raw.len() < BEARER_PREFIX.len()
        || !raw[..BEARER_PREFIX.len()].eq_ignore_ascii_case(BEARER_PREFIX)
    {
        return None;
    }
    let rest = &raw[BEARER_PREFIX.len()..];
    let token = rest.strip_prefix(' ').unwrap_or(rest);
    if token.is_empty() || token.starts_with(|ch: char| ch.is_whitespace()) {
        return None;
    }
    Some(token)
}
