//! Upstream fetch capability.
//!
//! Peers perform the actual origin fetch behind the [`UpstreamFetcher`]
//! trait, so the node logic never touches an HTTP client directly and tests
//! substitute a deterministic stub. The production implementation wraps
//! `reqwest` and buffers the whole response body in memory (bodies are not
//! streamed across the peer wire).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mesh_protocol::{ProxiedRequest, ProxiedResponse};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("building upstream request: {0}")]
    BadRequest(String),
    #[error("upstream fetch failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch(&self, request: &ProxiedRequest) -> Result<ProxiedResponse, FetchError>;
}

/// The response a peer sends back when its upstream fetch fails, so the
/// leader's waiting client handler is unblocked instead of hanging.
pub fn bad_gateway(request_url: &str, reason: &str) -> ProxiedResponse {
    let body = format!("{reason}\n").into_bytes();
    ProxiedResponse {
        status: "502 Bad Gateway".to_owned(),
        request_url: request_url.to_owned(),
        header: HashMap::new(),
        content_length: body.len() as i64,
        body,
    }
}

// ---------------------------------------------------------------------------
// Production fetcher
// ---------------------------------------------------------------------------

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build the shared client. `fetch_timeout` bounds the whole fetch
    /// (connect through body); `None` leaves it unbounded.
    pub fn new(fetch_timeout: Option<Duration>) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = fetch_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::BadRequest(e.to_string()))?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl UpstreamFetcher for HttpFetcher {
    async fn fetch(&self, request: &ProxiedRequest) -> Result<ProxiedResponse, FetchError> {
        let target = format!("http://{}", request.request_url);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FetchError::BadRequest(format!("invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &target);
        for (key, values) in &request.header {
            for value in values {
                builder = builder.header(key.as_str(), value.as_str());
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status().to_string();
        let mut header: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            match value.to_str() {
                Ok(text) => header
                    .entry(name.as_str().to_owned())
                    .or_default()
                    .push(text.to_owned()),
                Err(_) => warn!(header = %name, "dropping non-UTF-8 upstream header value"),
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?
            .to_vec();

        Ok(ProxiedResponse {
            status,
            request_url: request.request_url.clone(),
            content_length: body.len() as i64,
            header,
            body,
        })
    }
}
