// ABOUTME: HTTP readiness and liveness probing of sandbox endpoints
// ABOUTME: Shared by the docker and remote backends to decide when a sandbox is usable

use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::providers::{ProviderError, Result};

/// Default device profile started by the readiness call
pub const DEFAULT_PROBE_DEVICE: &str = "Pixel_7_Pro_API_33";

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Path appended to `http://{endpoint}`
    pub path: String,
    /// JSON body; when present the probe is a POST, otherwise a GET
    pub body: Option<Value>,
    /// Timeout of a single probe request
    pub request_timeout: Duration,
    /// Delay between readiness attempts
    pub retry_interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: "/start".to_string(),
            body: Some(serde_json::json!({ "avd_name": DEFAULT_PROBE_DEVICE })),
            request_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Issues HTTP probes against sandbox endpoints
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    config: ProbeConfig,
}

impl HttpProbe {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to build probe client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn url_for(&self, endpoint: &str) -> String {
        let path = if self.config.path.starts_with('/') {
            self.config.path.clone()
        } else {
            format!("/{}", self.config.path)
        };

        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{}{}", endpoint.trim_end_matches('/'), path)
        } else {
            format!("http://{}{}", endpoint, path)
        }
    }

    /// Single probe; any transport failure or non-success status is unhealthy
    pub async fn check(&self, endpoint: &str) -> bool {
        let url = self.url_for(endpoint);
        let request = match &self.config.body {
            Some(body) => self.client.post(&url).json(body),
            None => self.client.get(&url),
        };

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let healthy = matches!(
                    status,
                    StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED
                );
                if !healthy {
                    debug!(endpoint = %endpoint, status = %status, "Probe returned non-success status");
                }
                healthy
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Probe request failed");
                false
            }
        }
    }

    /// Probe until the endpoint answers or `timeout` elapses
    pub async fn wait_ready(&self, endpoint: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.check(endpoint).await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(endpoint = %endpoint, "Sandbox never passed readiness probe");
                return Err(ProviderError::ProvisionTimeout(timeout.as_secs()));
            }

            let remaining = deadline - now;
            tokio::time::sleep(self.config.retry_interval.min(remaining)).await;
        }
    }
}
