//! Etcd discovery service client

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Timeout for a single discovery request
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability to issue fresh etcd discovery tokens
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Request a new token for a cluster of `size` etcd members
    async fn new_token(&self, endpoint: &str, size: u32) -> Result<String>;
}

/// Discovery client for the public etcd discovery protocol
///
/// `GET {endpoint}/new?size=N` answers with the full discovery URL; the
/// token is its last path segment.
#[derive(Clone, Debug)]
pub struct HttpDiscoveryClient {
    client: reqwest::Client,
}

impl HttpDiscoveryClient {
    /// Create a client with the default request timeout
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .map_err(|e| Error::discovery(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DiscoveryClient for HttpDiscoveryClient {
    async fn new_token(&self, endpoint: &str, size: u32) -> Result<String> {
        let url = format!("{}/new?size={}", endpoint.trim_end_matches('/'), size);
        debug!(url = %url, "requesting etcd discovery token");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::discovery(format!("{endpoint} unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::discovery(format!(
                "{endpoint} answered with status {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::discovery(format!("failed to read discovery response: {e}")))?;
        token_from_url(&body)
    }
}

/// Extract the token from a discovery URL
pub(crate) fn token_from_url(url: &str) -> Result<String> {
    let token = url
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    if token.is_empty() || token.contains(':') {
        return Err(Error::discovery(format!(
            "discovery response is not a token URL: {}",
            url.trim()
        )));
    }
    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_url() {
        assert_eq!(
            token_from_url("https://discovery.etcd.io/6a28e078895c5ec737174db2419bb2f3\n").unwrap(),
            "6a28e078895c5ec737174db2419bb2f3"
        );
        assert_eq!(token_from_url("https://d.example/abc/").unwrap(), "abc");
    }

    #[test]
    fn test_garbage_response_rejected() {
        assert!(matches!(
            token_from_url(""),
            Err(Error::DiscoveryUnavailable(_))
        ));
        assert!(token_from_url("https://").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_discovery_unavailable() {
        let client = HttpDiscoveryClient::new().unwrap();
        // port 9 (discard) on loopback refuses connections
        let err = client.new_token("http://127.0.0.1:9", 3).await.unwrap_err();
        assert!(matches!(err, Error::DiscoveryUnavailable(_)));
    }
}
