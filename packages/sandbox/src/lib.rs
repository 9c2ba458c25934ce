// ABOUTME: Sandbox pool core: lifecycle backends, slot registry, pool manager and health monitor
// ABOUTME: Grants rollout workers exclusive time-bounded leases on warm sandboxes

pub mod health;
pub mod manager;
pub mod probe;
pub mod providers;
pub mod registry;
pub mod settings;
pub mod types;

pub use health::{HealthMonitor, SweepReport};
pub use manager::{PoolError, PoolManager, PoolSnapshot, ScaleOutcome};
pub use probe::{HttpProbe, ProbeConfig, DEFAULT_PROBE_DEVICE};
pub use providers::{
    BackendKind, DockerProvider, DockerProviderConfig, InMemoryProvider, ProviderError,
    ProvisioningController, RemoteEnvProvider, RemoteProviderConfig,
};
pub use registry::{Lease, PoolStats, SlotCounts, SlotState, SlotView};
pub use settings::{PoolSettings, RecyclePolicy, SettingsError};
pub use types::{Endpoint, ResourceSpec, SlotId};
