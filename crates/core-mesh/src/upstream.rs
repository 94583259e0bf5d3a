//! Execution of proxied HTTP requests against their real destination.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::wire::{ProxyRequest, ProxyResponse};

/// Request headers that describe the hop, not the request.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Something that can carry out a [`ProxyRequest`] locally.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn execute(&self, request: &ProxyRequest) -> Result<ProxyResponse, UpstreamError>;
}

/// [`Upstream`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn request_headers(request: &ProxyRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => log::debug!("upstream: dropping malformed header {:?}", name),
        }
    }
    headers
}

/// First value of each response header; non-UTF-8 values are dropped.
fn response_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    out
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn execute(&self, request: &ProxyRequest) -> Result<ProxyResponse, UpstreamError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| UpstreamError::InvalidMethod(request.method.clone()))?;
        let response = self
            .client
            .request(method, &request.url)
            .headers(request_headers(request))
            .body(request.body.clone())
            .send()
            .await?;
        let status_code = response.status().as_u16();
        let headers = response_headers(response.headers());
        let body = response.bytes().await?.to_vec();
        Ok(ProxyResponse {
            status_code,
            headers,
            body,
        })
    }
}
