// ABOUTME: Worker-side client for the sandpool scheduling service
// ABOUTME: Acquires and releases sandbox leases with retry on saturation and transport faults

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

mod types;

pub use types::{LeaseInfo, PoolCounters, PoolHealth, ScaleResult, SlotSummary};
use types::{
    AcquireRequest, Envelope, ErrorDetail, ErrorEnvelope, ReleaseRequest, Released, ScaleRequest,
    SlotList,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Scheduler returned {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("No sandbox acquired after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Status code of an API error, if this is one
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Per-request timeout; must exceed the server's wait clamp
    pub request_timeout: Duration,
    /// Attempts made by `acquire` before giving up
    pub max_retries: u32,
    /// Fixed delay after a 503 from a saturated pool
    pub unavailable_delay: Duration,
    /// Linear step for transport and server faults
    pub backoff_step: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(330),
            max_retries: 10,
            unavailable_delay: Duration::from_secs(35),
            backoff_step: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Options for a single acquire
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    pub lease: Option<Duration>,
    pub wait_timeout: Option<Duration>,
}

/// HTTP client for the scheduling service
#[derive(Clone)]
pub struct SchedulerClient {
    http_client: Client,
    base_url: String,
    config: ClientConfig,
}

impl SchedulerClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClientError::Configuration(
                "scheduler URL must not be empty".to_string(),
            ));
        }

        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Acquire a sandbox, retrying while the pool is saturated or unreachable
    pub async fn acquire(&self, owner_id: &str, options: AcquireOptions) -> ClientResult<LeaseInfo> {
        let body = AcquireRequest {
            owner_id,
            lease_duration_seconds: options.lease.map(|d| d.as_secs()),
            wait_timeout_seconds: options.wait_timeout.map(|d| d.as_secs()),
        };
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!(owner_id = %owner_id, attempt, attempts, "Requesting sandbox");

            let result = self
                .http_client
                .post(self.url("/api/acquire"))
                .json(&body)
                .send()
                .await;

            let delay = match result {
                Ok(response) if response.status().is_success() => {
                    let lease: LeaseInfo = Self::parse(response).await?;
                    info!(
                        slot_id = %lease.slot_id,
                        endpoint = %lease.endpoint,
                        attempt,
                        "Sandbox acquired"
                    );
                    return Ok(lease);
                }
                Ok(response) => {
                    let err = Self::api_error(response).await;
                    last_error = err.to_string();
                    match err.status() {
                        Some(503) => {
                            warn!(attempt, attempts, "Pool saturated, waiting before retry");
                            self.config.unavailable_delay
                        }
                        Some(status) if status == 408 || status >= 500 => {
                            warn!(attempt, attempts, status, "Scheduler error, retrying");
                            self.config.backoff_step * attempt
                        }
                        _ => return Err(err),
                    }
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Scheduler unreachable, retrying");
                    last_error = e.to_string();
                    self.config.backoff_step * attempt
                }
            };

            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        Err(ClientError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    /// Release a lease held by `owner_id`
    pub async fn release(&self, slot_id: &str, owner_id: &str) -> ClientResult<()> {
        let response = self
            .http_client
            .post(self.url("/api/release"))
            .json(&ReleaseRequest { slot_id, owner_id })
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let released: Released = Self::handle(response).await?;
        if !released.released {
            return Err(ClientError::InvalidResponse(
                "scheduler did not confirm release".to_string(),
            ));
        }
        info!(slot_id = %slot_id, "Sandbox released");
        Ok(())
    }

    pub async fn health(&self) -> ClientResult<PoolHealth> {
        let response = self
            .http_client
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::handle(response).await
    }

    pub async fn slots(&self) -> ClientResult<Vec<SlotSummary>> {
        let response = self
            .http_client
            .get(self.url("/api/slots"))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let list: SlotList = Self::handle(response).await?;
        Ok(list.slots)
    }

    pub async fn scale(&self, baseline_size: usize) -> ClientResult<ScaleResult> {
        let response = self
            .http_client
            .post(self.url("/api/scale"))
            .json(&ScaleRequest { baseline_size })
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::handle(response).await
    }

    async fn handle<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
        if response.status().is_success() {
            Self::parse(response).await
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        envelope
            .data
            .ok_or_else(|| ClientError::InvalidResponse("response carried no data".to_string()))
    }

    async fn api_error(response: Response) -> ClientError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorEnvelope>(&text)
            .map(|envelope| envelope.error)
            .unwrap_or_else(|_| ErrorDetail {
                code: status
                    .canonical_reason()
                    .unwrap_or("UNKNOWN")
                    .to_uppercase()
                    .replace(' ', "_"),
                message: text,
            });

        ClientError::Api {
            status: status.as_u16(),
            code: detail.code,
            message: detail.message,
        }
    }
}
