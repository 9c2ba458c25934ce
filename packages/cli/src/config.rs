// ABOUTME: Process configuration for the scheduler from command-line flags and environment
// ABOUTME: Builds validated pool settings and backend configs before the service starts

use clap::Args;
use sandpool_config::{constants::*, EnvError};
use sandpool_sandbox::{
    BackendKind, DockerProviderConfig, PoolSettings, ProbeConfig, RecyclePolicy,
    RemoteProviderConfig, ResourceSpec, SettingsError, DEFAULT_PROBE_DEVICE,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("{0}")]
    InvalidBackend(String),
    #[error("{0} must be set for the {1} backend")]
    Missing(&'static str, &'static str),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Flags of `sandpool serve`, read once at startup
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Free sandboxes kept warm
    #[arg(long, default_value_t = 64)]
    pub baseline_size: usize,

    /// Hard ceiling on sandboxes in any state
    #[arg(long, default_value_t = 96)]
    pub max_size: usize,

    #[arg(long, default_value_t = 6000)]
    pub cpu_millicores: u32,

    #[arg(long, default_value_t = 12000)]
    pub memory_mb: u64,

    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Probe slots whose last successful probe is older than this
    #[arg(long, default_value_t = 1200)]
    pub probe_staleness_secs: u64,

    /// Lease granted when the caller does not ask for one
    #[arg(long, default_value_t = 3600)]
    pub lease_secs: u64,

    #[arg(long, default_value_t = 14400)]
    pub max_lease_secs: u64,

    /// Default time an acquire waits for a sandbox
    #[arg(long, default_value_t = 60)]
    pub wait_timeout_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub provision_retries: u32,

    #[arg(long, default_value_t = 900)]
    pub readiness_timeout_secs: u64,

    /// What happens to a released sandbox: reuse or replace
    #[arg(long, default_value = "reuse")]
    pub recycle: RecyclePolicy,

    /// Drain Free slots above baseline after this much idle time
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            baseline_size: 64,
            max_size: 96,
            cpu_millicores: 6000,
            memory_mb: 12000,
            host: "0.0.0.0".to_string(),
            port: 8080,
            sweep_interval_secs: 60,
            probe_staleness_secs: 1200,
            lease_secs: 3600,
            max_lease_secs: 14400,
            wait_timeout_secs: 60,
            request_timeout_secs: 300,
            provision_retries: 3,
            readiness_timeout_secs: 900,
            recycle: RecyclePolicy::Reuse,
            idle_timeout_secs: None,
        }
    }
}

impl ServeArgs {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Validated pool settings for these flags
    pub fn pool_settings(&self) -> Result<PoolSettings, ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::PortOutOfRange(self.port));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.cpu_millicores == 0 || self.memory_mb == 0 {
            return Err(ConfigError::Invalid {
                field: "resource_spec",
                reason: "cpu and memory must be positive".to_string(),
            });
        }

        let settings = PoolSettings {
            baseline_size: self.baseline_size,
            max_size: self.max_size,
            resource_spec: ResourceSpec::new(self.cpu_millicores, self.memory_mb),
            default_lease: Duration::from_secs(self.lease_secs),
            max_lease: Duration::from_secs(self.max_lease_secs),
            default_wait_timeout: Duration::from_secs(self.wait_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            probe_staleness: Duration::from_secs(self.probe_staleness_secs),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            provision_retries: self.provision_retries,
            recycle: self.recycle,
            ..PoolSettings::default()
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Backend and deployment settings taken from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    pub backend: BackendKind,
    pub session_root: Option<String>,
    pub docker_image: Option<String>,
    pub container_port: u16,
    pub advertise_host: Option<String>,
    pub remote_api_url: Option<String>,
    pub remote_api_token: Option<String>,
    pub probe_path: Option<String>,
    pub probe_device: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            session_root: None,
            docker_image: None,
            container_port: DockerProviderConfig::default().container_port,
            advertise_host: None,
            remote_api_url: None,
            remote_api_token: None,
            probe_path: None,
            probe_device: DEFAULT_PROBE_DEVICE.to_string(),
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend = match sandpool_config::var(SANDPOOL_BACKEND) {
            Some(value) => value
                .parse::<BackendKind>()
                .map_err(|e| ConfigError::InvalidBackend(e.to_string()))?,
            None => defaults.backend,
        };

        let container_port =
            sandpool_config::parse_or(SANDPOOL_CONTAINER_PORT, defaults.container_port)?;
        if container_port == 0 {
            return Err(ConfigError::PortOutOfRange(container_port));
        }

        let config = Self {
            backend,
            session_root: sandpool_config::var(SANDPOOL_SESSION_ROOT),
            docker_image: sandpool_config::var(SANDPOOL_DOCKER_IMAGE),
            container_port,
            advertise_host: sandpool_config::var(SANDPOOL_ADVERTISE_HOST),
            remote_api_url: sandpool_config::var(SANDPOOL_REMOTE_API_URL),
            remote_api_token: sandpool_config::var(SANDPOOL_REMOTE_API_TOKEN),
            probe_path: sandpool_config::var(SANDPOOL_PROBE_PATH),
            probe_device: sandpool_config::var_or(SANDPOOL_PROBE_DEVICE, &defaults.probe_device),
        };

        if config.backend == BackendKind::Remote && config.remote_api_url.is_none() {
            return Err(ConfigError::Missing(SANDPOOL_REMOTE_API_URL, "remote"));
        }

        Ok(config)
    }

    pub fn probe_config(&self) -> ProbeConfig {
        let mut probe = ProbeConfig {
            body: Some(serde_json::json!({ "avd_name": self.probe_device })),
            ..ProbeConfig::default()
        };
        if let Some(path) = &self.probe_path {
            probe.path = path.clone();
        }
        probe
    }

    pub fn docker_config(&self, readiness_timeout: Duration) -> DockerProviderConfig {
        let mut config = DockerProviderConfig {
            container_port: self.container_port,
            readiness_timeout,
            probe: self.probe_config(),
            ..DockerProviderConfig::default()
        };
        if let Some(image) = &self.docker_image {
            config.image = image.clone();
        }
        if let Some(host) = &self.advertise_host {
            config.advertise_host = host.clone();
        }
        config
    }

    pub fn remote_config(
        &self,
        readiness_timeout: Duration,
    ) -> Result<RemoteProviderConfig, ConfigError> {
        let base_url = self
            .remote_api_url
            .clone()
            .ok_or(ConfigError::Missing(SANDPOOL_REMOTE_API_URL, "remote"))?;

        Ok(RemoteProviderConfig {
            base_url,
            api_token: self.remote_api_token.clone(),
            image: self.docker_image.clone(),
            readiness_timeout,
            probe: self.probe_config(),
            ..RemoteProviderConfig::default()
        })
    }
}
