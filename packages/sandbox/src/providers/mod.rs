// ABOUTME: Lifecycle controller trait and implementations for sandbox backends
// ABOUTME: Defines the swappable interface used to provision, probe and terminate sandboxes

use async_trait::async_trait;
use std::str::FromStr;
use thiserror::Error;

use crate::types::{Endpoint, ResourceSpec, SlotId};

pub mod docker;
pub mod memory;
pub mod remote;

pub use docker::{DockerProvider, DockerProviderConfig};
pub use memory::InMemoryProvider;
pub use remote::{RemoteEnvProvider, RemoteProviderConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Sandbox did not become ready within {0} seconds")]
    ProvisionTimeout(u64),

    #[error("Host cannot satisfy resource request: {0}")]
    ResourceExhausted(String),

    #[error("Host virtualization layer unavailable: {0}")]
    Unavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether a failed provisioning attempt may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProvisionTimeout(_) | Self::ResourceExhausted(_) | Self::Backend(_)
        )
    }

    /// Whether the error means the service can no longer reach its host layer
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Which lifecycle backend a running instance uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Simulated in-process sandboxes
    Memory,
    /// Local containers through the Docker daemon ("simple" strategy)
    Docker,
    /// Managed cloud environments over HTTP ("advanced" strategy)
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Docker => "docker",
            Self::Remote => "remote",
        }
    }
}

impl FromStr for BackendKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "docker" | "simple" => Ok(Self::Docker),
            "remote" | "advanced" => Ok(Self::Remote),
            other => Err(ProviderError::Config(format!(
                "Unknown sandbox backend '{}'. Expected one of: memory, docker (simple), remote (advanced)",
                other
            ))),
        }
    }
}

/// Capability interface over a host virtualization backend.
///
/// Every operation mutates host-level resources outside process memory and
/// must be safe to retry.
#[async_trait]
pub trait ProvisioningController: Send + Sync {
    /// Short backend name used in logs and health output
    fn name(&self) -> &str;

    /// Check if the backend is reachable and configured correctly
    async fn is_available(&self) -> Result<bool>;

    /// Create one sandbox sized per `spec` and wait until it is ready
    async fn provision(&self, slot_id: &SlotId, spec: &ResourceSpec) -> Result<Endpoint>;

    /// Tear down the sandbox backing `slot_id`, releasing all host resources.
    /// Terminating a slot that no longer exists succeeds.
    async fn terminate(&self, slot_id: &SlotId) -> Result<()>;

    /// Lightweight liveness check; never blocks indefinitely
    async fn probe(&self, endpoint: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("memory", BackendKind::Memory)]
    #[case("docker", BackendKind::Docker)]
    #[case("simple", BackendKind::Docker)]
    #[case("Remote", BackendKind::Remote)]
    #[case(" advanced ", BackendKind::Remote)]
    fn test_backend_kind_parsing(#[case] input: &str, #[case] expected: BackendKind) {
        assert_eq!(input.parse::<BackendKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_backend_is_config_error() {
        let err = "kubernetes".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::ProvisionTimeout(5).is_retryable());
        assert!(ProviderError::ResourceExhausted("cpu".into()).is_retryable());
        assert!(!ProviderError::Unavailable("socket".into()).is_retryable());
        assert!(ProviderError::Unavailable("socket".into()).is_fatal());
        assert!(!ProviderError::Config("bad".into()).is_retryable());
    }
}
