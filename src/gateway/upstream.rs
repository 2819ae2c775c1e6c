//! Transport to OpenAI-compatible providers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

use super::GatewayError;
use super::provider::Provider;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);
const APP_TITLE: &str = "Ada Chat";
const APP_REFERER: &str = "https://ada.local";

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub streaming: bool,
    /// Overrides the transport's default timeout for this call.
    pub timeout: Option<Duration>,
}

impl UpstreamRequest {
    /// POST to one of the provider's endpoints with its credentials attached.
    pub fn for_provider(provider: &Provider, url: String, body: Value, streaming: bool) -> Self {
        let mut headers = BTreeMap::new();
        if !provider.api_key.is_empty() {
            headers.insert(
                "Authorization".to_string(),
                format!("Bearer {}", provider.api_key),
            );
        }
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("X-Title".to_string(), APP_TITLE.to_string());
        headers.insert("HTTP-Referer".to_string(), APP_REFERER.to_string());
        Self {
            url,
            headers,
            body,
            streaming,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub enum UpstreamBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, GatewayError>>),
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            UpstreamBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn full(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: UpstreamBody::Full(body.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drains the body into memory, however it arrived.
    pub async fn into_bytes(self) -> Result<Bytes, GatewayError> {
        match self.body {
            UpstreamBody::Full(bytes) => Ok(bytes),
            UpstreamBody::Stream(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, GatewayError>;
}

#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new() -> Result<Self, GatewayError> {
        Self::with_timeout(DEFAULT_UPSTREAM_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| GatewayError::Upstream {
                message: format!("upstream http client error: {err}"),
            })?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        let mut req = self
            .client
            .post(&request.url)
            .timeout(request.timeout.unwrap_or(self.timeout));
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        let req = req.json(&request.body);

        let response = req.send().await.map_err(|err| GatewayError::Upstream {
            message: format!("upstream request failed: {err}"),
        })?;
        let status = response.status().as_u16();

        if request.streaming && response.status().is_success() {
            let stream = response.bytes_stream().map(|chunk| {
                chunk.map_err(|err| GatewayError::Upstream {
                    message: format!("upstream stream failed: {err}"),
                })
            });
            return Ok(UpstreamResponse {
                status,
                body: UpstreamBody::Stream(stream.boxed()),
            });
        }

        let (body, truncated) = crate::utils::http::response_bytes_truncated(
            response,
            crate::utils::http::MAX_RESPONSE_BODY_BYTES,
        )
        .await;
        if truncated {
            tracing::warn!(status, url = %request.url, "upstream response body truncated");
        }
        Ok(UpstreamResponse::full(status, body))
    }
}
