// ABOUTME: Docker lifecycle backend running each sandbox as a local container
// ABOUTME: Uses bollard to create, start, inspect and remove containers with fixed resource limits

use super::{ProviderError, ProvisioningController, Result};
use crate::probe::{HttpProbe, ProbeConfig};
use crate::types::{Endpoint, ResourceSpec, SlotId};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, PortBinding, PortMap},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DockerProviderConfig {
    /// Image every sandbox container runs
    pub image: String,
    /// Port the sandbox agent listens on inside the container
    pub container_port: u16,
    /// Host name clients use to reach published container ports
    pub advertise_host: String,
    pub pull_timeout: Duration,
    /// How long a new container may take to pass its readiness probe
    pub readiness_timeout: Duration,
    /// Grace period given to a container before it is killed
    pub stop_grace_secs: i64,
    pub label_prefix: String,
    pub probe: ProbeConfig,
}

impl Default for DockerProviderConfig {
    fn default() -> Self {
        Self {
            image: "sandpool/android-sandbox:latest".to_string(),
            container_port: 6060,
            advertise_host: "127.0.0.1".to_string(),
            pull_timeout: Duration::from_secs(600),
            readiness_timeout: Duration::from_secs(900),
            stop_grace_secs: 10,
            label_prefix: "sandpool".to_string(),
            probe: ProbeConfig::default(),
        }
    }
}

pub struct DockerProvider {
    client: Docker,
    config: DockerProviderConfig,
    probe: HttpProbe,
    /// Set once the sandbox image is known to be present locally
    image_pulled_at: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
}

impl DockerProvider {
    /// Connect to the local Docker daemon using default settings
    pub fn new(config: DockerProviderConfig) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Self::with_client(client, config)
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker, config: DockerProviderConfig) -> Result<Self> {
        let probe = HttpProbe::new(config.probe.clone())?;
        Ok(Self {
            client,
            config,
            probe,
            image_pulled_at: RwLock::new(None),
        })
    }

    fn container_name(&self, slot_id: &SlotId) -> String {
        format!("{}-{}", self.config.label_prefix, slot_id)
    }

    fn port_key(&self) -> String {
        format!("{}/tcp", self.config.container_port)
    }

    /// Build the container definition for one sandbox
    fn to_container_config(&self, slot_id: &SlotId, spec: &ResourceSpec) -> Config<String> {
        let labels = HashMap::from([
            (format!("{}.managed", self.config.label_prefix), "true".to_string()),
            (format!("{}.slot", self.config.label_prefix), slot_id.to_string()),
        ]);

        // Host port left empty so Docker assigns an ephemeral one
        let mut port_bindings = PortMap::new();
        port_bindings.insert(
            self.port_key(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(self.port_key(), HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            nano_cpus: Some(spec.cpu_millicores as i64 * 1_000_000),
            memory: Some(spec.memory_bytes as i64),
            ..Default::default()
        };

        Config {
            image: Some(self.config.image.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Map a daemon error, checking reachability for transport failures
    async fn classify(&self, err: bollard::errors::Error) -> ProviderError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => {
                let lowered = message.to_lowercase();
                if lowered.contains("insufficient")
                    || lowered.contains("no space")
                    || lowered.contains("out of memory")
                    || lowered.contains("resources")
                {
                    ProviderError::ResourceExhausted(message)
                } else {
                    ProviderError::Backend(format!("docker returned {}: {}", status_code, message))
                }
            }
            other => {
                if self.client.ping().await.is_err() {
                    ProviderError::Unavailable(other.to_string())
                } else {
                    ProviderError::Backend(other.to_string())
                }
            }
        }
    }

    async fn image_exists(&self) -> Result<bool> {
        match self.client.inspect_image(&self.config.image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(self.classify(e).await),
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        if self.image_pulled_at.read().await.is_some() {
            return Ok(());
        }

        if !self.image_exists().await? {
            self.pull_image().await?;
        }

        *self.image_pulled_at.write().await = Some(chrono::Utc::now());
        Ok(())
    }

    async fn pull_image(&self) -> Result<()> {
        let image = &self.config.image;
        info!(image = %image, timeout = ?self.config.pull_timeout, "Pulling sandbox image");

        let options = CreateImageOptions {
            from_image: image.clone(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.config.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(item) = stream.next().await {
                let info = item.map_err(|e| {
                    ProviderError::Backend(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::Backend(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::Backend(format!(
                "Timeout pulling image {} after {:?}",
                image, self.config.pull_timeout
            ))),
        }
    }

    async fn published_port(&self, name: &str) -> Result<u16> {
        let inspect = self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| ProviderError::Backend(e.to_string()))?;

        let ports = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .ok_or_else(|| {
                ProviderError::Backend(format!("Container {} has no network settings", name))
            })?;

        extract_host_port(&ports, &self.port_key())
    }

    /// Remove a container regardless of its state; missing containers are fine
    async fn remove_quietly(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }
}

fn extract_host_port(ports: &PortMap, key: &str) -> Result<u16> {
    let host_port = ports
        .get(key)
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| bindings.iter().find_map(|b| b.host_port.as_ref()))
        .ok_or_else(|| ProviderError::Backend(format!("Missing host port for {}", key)))?;

    host_port
        .parse::<u16>()
        .map_err(|_| ProviderError::Backend(format!("Invalid host port '{}' for {}", host_port, key)))
}

#[async_trait]
impl ProvisioningController for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn provision(&self, slot_id: &SlotId, spec: &ResourceSpec) -> Result<Endpoint> {
        let name = self.container_name(slot_id);
        info!(slot_id = %slot_id, container = %name, "Creating sandbox container");

        self.ensure_image().await?;

        // A previous attempt for this slot may have left a container behind
        self.remove_quietly(&name).await?;

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        if let Err(e) = self
            .client
            .create_container(Some(options), self.to_container_config(slot_id, spec))
            .await
        {
            return Err(self.classify(e).await);
        }

        if let Err(e) = self
            .client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            return Err(self.classify(e).await);
        }

        let port = self.published_port(&name).await?;
        let endpoint = format!("{}:{}", self.config.advertise_host, port);
        debug!(slot_id = %slot_id, endpoint = %endpoint, "Container started, waiting for readiness");

        self.probe
            .wait_ready(&endpoint, self.config.readiness_timeout)
            .await?;

        info!(slot_id = %slot_id, endpoint = %endpoint, "Sandbox container ready");
        Ok(endpoint)
    }

    async fn terminate(&self, slot_id: &SlotId) -> Result<()> {
        let name = self.container_name(slot_id);
        info!(slot_id = %slot_id, container = %name, "Terminating sandbox container");

        let options = StopContainerOptions {
            t: self.config.stop_grace_secs,
        };
        match self.client.stop_container(&name, Some(options)).await {
            Ok(()) => {}
            // 304: already stopped, 404: already gone
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => warn!(container = %name, error = %e, "Graceful stop failed, forcing removal"),
        }

        self.remove_quietly(&name).await
    }

    async fn probe(&self, endpoint: &str) -> bool {
        self.probe.check(endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> DockerProvider {
        let client = Docker::connect_with_local_defaults().unwrap();
        DockerProvider::with_client(client, DockerProviderConfig::default()).unwrap()
    }

    #[test]
    fn test_container_config_limits_and_labels() {
        let provider = provider();
        let slot_id = SlotId::from("slot-1");
        let config = provider.to_container_config(&slot_id, &ResourceSpec::new(6000, 12000));

        let host_config = config.host_config.unwrap();
        assert_eq!(host_config.nano_cpus, Some(6_000_000_000));
        assert_eq!(host_config.memory, Some(12000 * 1024 * 1024));

        let labels = config.labels.unwrap();
        assert_eq!(labels.get("sandpool.managed").map(String::as_str), Some("true"));
        assert_eq!(labels.get("sandpool.slot").map(String::as_str), Some("slot-1"));

        let bindings = host_config.port_bindings.unwrap();
        let binding = bindings.get("6060/tcp").unwrap().as_ref().unwrap();
        assert!(binding[0].host_port.is_none());
    }

    #[tokio::test]
    async fn test_create_rejections_are_classified() {
        let provider = provider();

        let rejected = provider
            .classify(bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: "Range of CPUs is from 0.01 to 4.00, insufficient resources".to_string(),
            })
            .await;
        assert!(matches!(rejected, ProviderError::ResourceExhausted(_)));

        let conflict = provider
            .classify(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message: "container name already in use".to_string(),
            })
            .await;
        assert!(matches!(conflict, ProviderError::Backend(_)));
    }

    #[test]
    fn test_container_name_uses_slot_id() {
        let provider = provider();
        assert_eq!(
            provider.container_name(&SlotId::from("slot-abc")),
            "sandpool-slot-abc"
        );
    }

    #[test]
    fn test_extract_host_port() {
        let mut ports = PortMap::new();
        ports.insert(
            "6060/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("49153".to_string()),
            }]),
        );

        assert_eq!(extract_host_port(&ports, "6060/tcp").unwrap(), 49153);
        assert!(extract_host_port(&ports, "8080/tcp").is_err());
    }
}
