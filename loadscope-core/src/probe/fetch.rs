use async_trait::async_trait;
use reqwest::header::{HeaderMap, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, SERVER};
use reqwest::Client;
use serde::Serialize;

use crate::browser::{BrowserError, BrowserResult};
use crate::config::HttpSection;

/// Fine-grained connection timings, only present when the transport exposes
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingBreakdown {
    pub dns_lookup: Option<f64>,
    pub tcp_connection: Option<f64>,
    pub tls_negotiation: Option<f64>,
    pub server_processing: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseHeaders {
    pub server: Option<String>,
    #[serde(rename = "content-type")]
    pub content_type: Option<String>,
    #[serde(rename = "content-length")]
    pub content_length: Option<u64>,
}

impl ResponseHeaders {
    fn from_map(headers: &HeaderMap) -> Self {
        let text = |name| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            server: text(SERVER),
            content_type: text(CONTENT_TYPE),
            content_length: text(CONTENT_LENGTH).and_then(|len| len.trim().parse().ok()),
        }
    }
}

/// Status line and headers of an uncached GET; the body is not read.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedHead {
    pub status: u16,
    pub headers: ResponseHeaders,
    pub timing: Option<TimingBreakdown>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads the full response body as text.
    async fn fetch_text(&self, url: &str) -> BrowserResult<String>;

    /// Resolves as soon as response headers arrive.
    async fn fetch_head(&self, url: &str) -> BrowserResult<FetchedHead>;
}

#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new(config: &HttpSection) -> BrowserResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout())
            .build()
            .map_err(|err| BrowserError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch_text(&self, url: &str) -> BrowserResult<String> {
        let response = self.client.get(url).send().await?;
        Ok(response.text().await?)
    }

    async fn fetch_head(&self, url: &str) -> BrowserResult<FetchedHead> {
        let response = self
            .client
            .get(url)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        Ok(FetchedHead {
            status: response.status().as_u16(),
            headers: ResponseHeaders::from_map(response.headers()),
            // reqwest does not surface per-phase connection timings.
            timing: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn headers_are_read_case_insensitively() {
        let mut map = HeaderMap::new();
        map.insert("Server", HeaderValue::from_static("nginx"));
        map.insert("content-type", HeaderValue::from_static("text/html"));
        map.insert("Content-Length", HeaderValue::from_static("1024"));
        let headers = ResponseHeaders::from_map(&map);
        assert_eq!(headers.server.as_deref(), Some("nginx"));
        assert_eq!(headers.content_type.as_deref(), Some("text/html"));
        assert_eq!(headers.content_length, Some(1024));
    }

    #[test]
    fn breakdown_serializes_nulls() {
        let value = serde_json::to_value(TimingBreakdown::default()).unwrap();
        assert!(value["dnsLookup"].is_null());
        assert!(value["serverProcessing"].is_null());
    }
}
