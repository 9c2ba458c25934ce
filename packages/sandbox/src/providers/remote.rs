// ABOUTME: Remote lifecycle backend driving a managed cloud environment service over HTTP
// ABOUTME: Creates environments, polls them until running, and confirms release after deletion

use super::{ProviderError, ProvisioningController, Result};
use crate::probe::{HttpProbe, ProbeConfig};
use crate::types::{Endpoint, ResourceSpec, SlotId};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RemoteProviderConfig {
    /// Base URL of the environment service, e.g. `https://envs.example.com/v1`
    pub base_url: String,
    pub api_token: Option<String>,
    /// Image or template the service should boot, if it needs one
    pub image: Option<String>,
    pub request_timeout: Duration,
    /// Delay between status polls
    pub poll_interval: Duration,
    /// Total budget for an environment to reach RUNNING and pass its probe
    pub readiness_timeout: Duration,
    /// How long to wait for a deleted environment to disappear
    pub release_timeout: Duration,
    pub probe: ProbeConfig,
}

impl Default for RemoteProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            api_token: None,
            image: None,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            readiness_timeout: Duration::from_secs(900),
            release_timeout: Duration::from_secs(300),
            probe: ProbeConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateEnvRequest<'a> {
    name: &'a str,
    cpu_millicores: u32,
    memory_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateEnvResponse {
    env_id: String,
}

#[derive(Debug, Deserialize)]
struct EnvInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnvSummary {
    env_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListEnvsResponse {
    #[serde(default)]
    envs: Vec<EnvSummary>,
}

/// How a started environment settled
enum EnvOutcome {
    Running(Endpoint),
    /// The environment can no longer become ready
    Failed(String),
}

enum EnvPhase {
    Pending,
    Running,
    Failed,
}

fn phase_of(status: &str) -> EnvPhase {
    match status.to_uppercase().as_str() {
        "RUNNING" | "READY" => EnvPhase::Running,
        "" | "PENDING" | "CREATING" | "CREATED" | "STARTING" => EnvPhase::Pending,
        _ => EnvPhase::Failed,
    }
}

pub struct RemoteEnvProvider {
    client: reqwest::Client,
    config: RemoteProviderConfig,
    probe: HttpProbe,
    /// Environment id backing each slot
    envs: RwLock<HashMap<SlotId, String>>,
}

impl RemoteEnvProvider {
    pub fn new(config: RemoteProviderConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(ProviderError::Config(
                "Remote environment service URL is empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let probe = HttpProbe::new(config.probe.clone())?;

        Ok(Self {
            client,
            config,
            probe,
            envs: RwLock::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn create_env(&self, slot_id: &SlotId, spec: &ResourceSpec) -> Result<String> {
        let body = CreateEnvRequest {
            name: slot_id.as_str(),
            cpu_millicores: spec.cpu_millicores,
            memory_mb: spec.memory_mb(),
            image: self.config.image.as_deref(),
        };

        let response = self
            .authorized(self.client.post(self.url("/envs")).json(&body))
            .send()
            .await
            .map_err(|e| ProviderError::Backend(format!("Create request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let created: CreateEnvResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Backend(format!("Malformed create response: {}", e)))?;
        Ok(created.env_id)
    }

    /// `None` when the service no longer knows the environment
    async fn describe_env(&self, env_id: &str) -> Result<Option<EnvInfo>> {
        let response = self
            .authorized(self.client.get(self.url(&format!("/envs/{}", env_id))))
            .send()
            .await
            .map_err(|e| ProviderError::Backend(format!("Describe request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| ProviderError::Backend(format!("Malformed describe response: {}", e)))
    }

    /// Look up an environment created under `name` that was never recorded,
    /// e.g. because the create response was lost
    async fn find_env_by_name(&self, name: &str) -> Result<Option<String>> {
        let response = self
            .authorized(self.client.get(self.url("/envs")).query(&[("name", name)]))
            .send()
            .await
            .map_err(|e| ProviderError::Backend(format!("List request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let listed: ListEnvsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Backend(format!("Malformed list response: {}", e)))?;
        Ok(listed.envs.into_iter().next().map(|env| env.env_id))
    }

    async fn delete_env(&self, env_id: &str) -> Result<()> {
        let response = self
            .authorized(self.client.delete(self.url(&format!("/envs/{}", env_id))))
            .send()
            .await
            .map_err(|e| ProviderError::Backend(format!("Delete request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(status_error(status, &text))
    }

    async fn wait_running(&self, env_id: &str, deadline: Instant) -> Result<EnvOutcome> {
        loop {
            match self.describe_env(env_id).await? {
                Some(info) => match phase_of(&info.status) {
                    EnvPhase::Running => {
                        if let Some(endpoint) = info.endpoint.filter(|e| !e.is_empty()) {
                            return Ok(EnvOutcome::Running(endpoint));
                        }
                    }
                    EnvPhase::Pending => {}
                    EnvPhase::Failed => {
                        return Ok(EnvOutcome::Failed(format!(
                            "Environment {} entered status {}",
                            env_id, info.status
                        )));
                    }
                },
                None => {
                    return Ok(EnvOutcome::Failed(format!(
                        "Environment {} disappeared while starting",
                        env_id
                    )));
                }
            }

            if Instant::now() >= deadline {
                return Err(ProviderError::ProvisionTimeout(
                    self.config.readiness_timeout.as_secs(),
                ));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

fn status_error(status: StatusCode, body: &str) -> ProviderError {
    let lowered = body.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::INSUFFICIENT_STORAGE
        || lowered.contains("quota")
        || lowered.contains("insufficient")
    {
        ProviderError::ResourceExhausted(format!("{}: {}", status, body))
    } else {
        ProviderError::Backend(format!("{}: {}", status, body))
    }
}

#[async_trait]
impl ProvisioningController for RemoteEnvProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn is_available(&self) -> Result<bool> {
        match self
            .authorized(self.client.get(self.url("/health")))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                warn!(status = %response.status(), "Environment service reported unhealthy");
                Ok(false)
            }
            Err(e) => {
                warn!("Environment service not reachable: {}", e);
                Ok(false)
            }
        }
    }

    async fn provision(&self, slot_id: &SlotId, spec: &ResourceSpec) -> Result<Endpoint> {
        let deadline = Instant::now() + self.config.readiness_timeout;

        // Reuse the environment of a previous attempt for this slot
        let existing = self.envs.read().await.get(slot_id).cloned();
        let env_id = match existing {
            Some(env_id) => env_id,
            None => {
                let env_id = self.create_env(slot_id, spec).await?;
                self.envs
                    .write()
                    .await
                    .insert(slot_id.clone(), env_id.clone());
                env_id
            }
        };
        info!(slot_id = %slot_id, env_id = %env_id, "Remote environment requested");

        let endpoint = match self.wait_running(&env_id, deadline).await? {
            EnvOutcome::Running(endpoint) => endpoint,
            EnvOutcome::Failed(reason) => {
                // Never retry against a dead environment
                self.envs.write().await.remove(slot_id);
                if let Err(e) = self.delete_env(&env_id).await {
                    warn!(env_id = %env_id, error = %e, "Failed to delete dead environment");
                }
                return Err(ProviderError::Backend(reason));
            }
        };
        debug!(slot_id = %slot_id, endpoint = %endpoint, "Remote environment running");

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.probe
            .wait_ready(&endpoint, remaining)
            .await
            .map_err(|_| ProviderError::ProvisionTimeout(self.config.readiness_timeout.as_secs()))?;

        info!(slot_id = %slot_id, env_id = %env_id, endpoint = %endpoint, "Remote environment ready");
        Ok(endpoint)
    }

    async fn terminate(&self, slot_id: &SlotId) -> Result<()> {
        let recorded = self.envs.read().await.get(slot_id).cloned();
        let env_id = match recorded {
            Some(env_id) => env_id,
            None => match self.find_env_by_name(slot_id.as_str()).await? {
                Some(env_id) => {
                    warn!(slot_id = %slot_id, env_id = %env_id, "Found unrecorded environment for slot");
                    env_id
                }
                None => {
                    debug!(slot_id = %slot_id, "No remote environment exists for slot");
                    return Ok(());
                }
            },
        };

        info!(slot_id = %slot_id, env_id = %env_id, "Deleting remote environment");
        let deadline = Instant::now() + self.config.release_timeout;

        loop {
            self.delete_env(&env_id).await?;
            tokio::time::sleep(self.config.poll_interval).await;

            if self.describe_env(&env_id).await?.is_none() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ProviderError::Backend(format!(
                    "Environment {} still present after {:?}",
                    env_id, self.config.release_timeout
                )));
            }
            debug!(env_id = %env_id, "Environment still present, deleting again");
        }

        self.envs.write().await.remove(slot_id);
        info!(slot_id = %slot_id, env_id = %env_id, "Remote environment released");
        Ok(())
    }

    async fn probe(&self, endpoint: &str) -> bool {
        self.probe.check(endpoint).await
    }
}
