use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::models::Method;

/// Fully prepared request handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    pub method: Method,
    pub endpoint: String,
    pub params: Option<Value>,
    pub data: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            params: None,
            data: None,
            headers: Vec::new(),
        }
    }

    /// Value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Response received from the API, whatever its status
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Final URL the response came from
    pub url: String,
    pub body: Value,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outcomes without a usable response
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Sent (or attempted) but nothing came back
    #[error("no response: {0}")]
    NoResponse(String),

    /// Request could not be constructed
    #[error("request setup failed: {0}")]
    Setup(String),
}

/// HTTP transport the request client sends through
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, TransportError>;

    /// Absolute URL an endpoint is sent to, when the transport knows it
    fn resolve(&self, _endpoint: &str) -> Option<String> {
        None
    }
}

/// reqwest-backed transport against a fixed API base URL
pub struct ReqwestTransport {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API base URL, always ending with `/`
    base_url: Url,
}

impl ReqwestTransport {
    /// Create a new transport
    pub fn new(
        base_url: &str,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: parse_base_url(base_url)?,
        })
    }

    /// Absolute URL for an endpoint
    pub fn url_for(&self, endpoint: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| TransportError::Setup(format!("invalid endpoint {:?}: {}", endpoint, e)))
    }
}

/// Parse a base URL, normalising it so relative joins keep its path
pub fn parse_base_url(base_url: &str) -> Result<Url> {
    let normalized = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };
    let url = Url::parse(&normalized).with_context(|| format!("Invalid API base URL: {}", base_url))?;
    if url.cannot_be_a_base() {
        anyhow::bail!("API base URL cannot be used as a base: {}", base_url);
    }
    Ok(url)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, TransportError> {
        let url = self.url_for(&request.endpoint)?;

        let mut builder = self.client.request(request.method.into(), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(params) = &request.params {
            builder = builder.query(params);
        }
        if let Some(data) = &request.data {
            builder = builder.json(data);
        }

        let req = builder
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        tracing::debug!(method = %req.method(), url = %req.url(), "Sending HTTP request");

        let response = match self.client.execute(req).await {
            Ok(response) => response,
            Err(e) => {
                let error_kind = error_kind(&e);
                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                if e.is_builder() {
                    return Err(TransportError::Setup(e.to_string()));
                }
                return Err(TransportError::NoResponse(format!("{} (kind: {})", e, error_kind)));
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let text = response.text().await.map_err(|e| {
            tracing::warn!(error = %e, url = %final_url, "Failed to read response body");
            TransportError::NoResponse(e.to_string())
        })?;

        tracing::debug!(status = status, url = %final_url, "Received HTTP response");

        Ok(TransportResponse {
            status,
            url: final_url,
            body: parse_body(&text),
        })
    }

    fn resolve(&self, endpoint: &str) -> Option<String> {
        self.url_for(endpoint).ok().map(|url| url.to_string())
    }
}

/// Categorize a reqwest error for logs
fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// JSON body, the raw text for non-JSON bodies, `null` when empty
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
