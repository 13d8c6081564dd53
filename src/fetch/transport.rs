//! Network seam for the resolver.
//!
//! The resolver only needs "GET this URL and give me status + bytes", so the
//! trait is deliberately narrow. [`HttpTransport`] is the production
//! implementation; tests script their own.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Raw response from a source endpoint.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url`. Errors are connection-level; HTTP error statuses are
    /// returned as responses.
    async fn get(&self, url: &str) -> Result<TransportResponse>;
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }
}
