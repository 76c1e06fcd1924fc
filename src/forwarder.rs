use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("Upstream request to {0} failed: {1}")]
    Transport(String, #[source] reqwest::Error),
    #[error("Reading upstream response from {0} failed: {1}")]
    Body(String, #[source] reqwest::Error),
}

/// Relays the station's request to the upstream collector.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
}

impl Forwarder {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ForwardError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Target URL for a request URI (path plus optional query).
    pub fn target(&self, request_uri: &str) -> String {
        format!("{}{}", self.base_url, request_uri)
    }

    /// GETs `{base_url}{request_uri}` and returns the upstream body verbatim.
    pub async fn forward(&self, request_uri: &str) -> Result<Bytes, ForwardError> {
        let url = self.target(request_uri);
        debug!("Forwarding station report to {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ForwardError::Transport(url.clone(), e))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ForwardError::Body(url.clone(), e))?;

        if !status.is_success() {
            error!("Upstream answered {} for {}", status, url);
        }
        Ok(body)
    }
}
