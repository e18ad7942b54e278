#![warn(missing_docs)]

//! # apirun-request
//!
//! Turns a declarative [`RequestSpec`] into an HTTP round trip and returns a
//! fully buffered [`ResponseEnvelope`].
//!
//! Non-2xx statuses are ordinary responses, never errors. Only transport-level
//! failures (DNS, connection, TLS, timeout) surface as
//! [`HostError::Transport`].

use std::collections::BTreeMap;
use std::error::Error as _;
use std::time::Duration;

use apirun_error::HostError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

mod spec;

pub use spec::{RequestBody, RequestOptions, RequestSpec, ResponseEnvelope};

/// Default `User-Agent` for outbound requests.
pub const DEFAULT_USER_AGENT: &str = concat!("apirun/", env!("CARGO_PKG_VERSION"));

/// Executes one HTTP request.
///
/// The sandbox holds an `Arc<dyn RequestExecutor>`, so tests can substitute a
/// stub that records requests instead of touching the network.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Perform `spec`, giving up after `timeout`.
    async fn execute(
        &self,
        spec: RequestSpec,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, HostError>;
}

/// [`RequestExecutor`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    /// Create an executor sending [`DEFAULT_USER_AGENT`].
    pub fn new() -> Result<Self, HostError> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    /// Create an executor with a custom default `User-Agent`.
    ///
    /// A `User-Agent` header set by the script still wins.
    pub fn with_user_agent(user_agent: &str) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            // Callers may drive each request from a different short-lived
            // runtime; a pooled connection would be bound to a dead one.
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| HostError::Internal(anyhow::anyhow!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RequestExecutor for ReqwestExecutor {
    async fn execute(
        &self,
        mut spec: RequestSpec,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, HostError> {
        if spec.url.trim().is_empty() {
            return Err(HostError::InvalidRequest("url is required".into()));
        }
        let url = reqwest::Url::parse(&spec.url)
            .map_err(|e| HostError::InvalidRequest(format!("invalid url: {e}")))?;
        let method = reqwest::Method::from_bytes(spec.effective_method().as_bytes())
            .map_err(|_| HostError::InvalidRequest(format!("invalid method: {}", spec.method)))?;
        let body = spec.encode_body()?;
        let headers = build_headers(&spec.headers)?;

        tracing::debug!(
            method = %method,
            host = url.host_str().unwrap_or(""),
            path = url.path(),
            "outbound request"
        );

        let mut request = self
            .client
            .request(method, url)
            .headers(headers)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| transport_error(&e, timeout))?;
        let status = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&e, timeout))?;

        tracing::debug!(status, bytes = body.len(), "response received");
        Ok(ResponseEnvelope::new(status, headers, body.to_vec()))
    }
}

fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, HostError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HostError::InvalidRequest(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| HostError::InvalidRequest(format!("invalid value for header {name}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

// `HeaderMap` names are already lower-case; keep the first value per name.
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    for (name, value) in headers {
        flat.entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    flat
}

fn transport_error(err: &reqwest::Error, timeout: Duration) -> HostError {
    if err.is_timeout() {
        HostError::Transport(format!("timed out after {}ms", timeout.as_millis()))
    } else {
        HostError::Transport(describe_error(err))
    }
}

// reqwest errors embed the full URL, which may carry credentials in the query.
fn describe_error(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    if let Some(url) = err.url() {
        message = message.replace(url.as_str(), &redacted(url));
    }
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn redacted(url: &reqwest::Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.set_fragment(None);
    let _ = clean.set_password(None);
    let _ = clean.set_username("");
    clean.to_string()
}
