//! HTTP surface: the proxy entrypoint and the status endpoint.
//!
//! `ANY /proxy?url=<target>` forwards the request through the router and
//! relays the upstream answer unchanged. Failures come back as JSON
//! `{"error", "details"}` with a gateway-class status.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use core_mesh::{status, ProxyRequest, ProxyResponse, ProxyRouter, RouteError};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Response headers the server framing recomputes.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "content-length", "transfer-encoding"];

#[derive(Clone)]
pub struct AppState {
    pub router: ProxyRouter,
}

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    url: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/proxy", any(proxy))
        .route("/status", get(node_status))
        .with_state(state)
}

fn error_response(status: StatusCode, error: &str, details: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error, "details": details.into() })),
    )
        .into_response()
}

fn request_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    out
}

fn relay(response: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        if SKIPPED_RESPONSE_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    (status, headers, response.body).into_response()
}

async fn proxy(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(url) = query.url.filter(|u| !u.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing url",
            "query parameter `url` is required",
        );
    };
    let request = ProxyRequest {
        method: method.as_str().to_string(),
        url,
        headers: request_headers(&headers),
        body: body.to_vec(),
    };
    debug!(method = %request.method, url = %request.url, "proxy request");

    match state.router.route(request).await {
        Ok(response) => relay(response),
        Err(e) => {
            warn!(kind = e.type_name(), error = %e, "proxy request failed");
            let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
            let error = match e {
                RouteError::Loop => "Routing loop detected",
                RouteError::InvalidUrl(_) => "Invalid url",
                _ => "P2P Proxy failed",
            };
            error_response(status, error, e.to_string())
        }
    }
}

async fn node_status(State(state): State<AppState>) -> Json<status::MeshStatus> {
    Json(status::snapshot(state.router.context()))
}
