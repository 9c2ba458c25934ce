// ABOUTME: In-process simulated backend with synthetic sandbox endpoints
// ABOUTME: Used for dry runs without a host virtualization layer and for exercising pool behaviour

use super::{ProviderError, ProvisioningController, Result};
use crate::types::{Endpoint, ResourceSpec, SlotId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const FIRST_PORT: u16 = 20000;

#[derive(Default)]
struct MemoryState {
    sandboxes: HashMap<SlotId, Endpoint>,
    unhealthy: HashSet<Endpoint>,
    pending_failures: VecDeque<ProviderError>,
    next_port: u16,
    provision_calls: usize,
    terminate_calls: usize,
    unavailable: bool,
}

/// Simulated sandboxes living only in process memory
pub struct InMemoryProvider {
    state: Mutex<MemoryState>,
    /// Maximum number of live sandboxes the simulated host accepts
    capacity: Option<usize>,
    /// Artificial provisioning latency
    provision_delay: Duration,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_port: FIRST_PORT,
                ..Default::default()
            }),
            capacity: None,
            provision_delay: Duration::ZERO,
        }
    }

    /// Limit how many sandboxes may exist at once
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    /// Make the next provisioning attempt fail with `error`
    pub async fn fail_next_provision(&self, error: ProviderError) {
        self.state.lock().await.pending_failures.push_back(error);
    }

    /// Make probes against `endpoint` fail from now on
    pub async fn mark_unhealthy(&self, endpoint: &str) {
        self.state.lock().await.unhealthy.insert(endpoint.to_string());
    }

    /// Simulate losing (or regaining) the host layer
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.sandboxes.len()
    }

    pub async fn contains(&self, slot_id: &SlotId) -> bool {
        self.state.lock().await.sandboxes.contains_key(slot_id)
    }

    pub async fn provision_calls(&self) -> usize {
        self.state.lock().await.provision_calls
    }

    pub async fn terminate_calls(&self) -> usize {
        self.state.lock().await.terminate_calls
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningController for InMemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(!self.state.lock().await.unavailable)
    }

    async fn provision(&self, slot_id: &SlotId, spec: &ResourceSpec) -> Result<Endpoint> {
        if !self.provision_delay.is_zero() {
            tokio::time::sleep(self.provision_delay).await;
        }

        let mut state = self.state.lock().await;
        state.provision_calls += 1;

        if state.unavailable {
            return Err(ProviderError::Unavailable(
                "simulated host is offline".to_string(),
            ));
        }

        if let Some(error) = state.pending_failures.pop_front() {
            debug!(slot_id = %slot_id, error = %error, "Injected provisioning failure");
            return Err(error);
        }

        if let Some(endpoint) = state.sandboxes.get(slot_id) {
            return Ok(endpoint.clone());
        }

        if let Some(capacity) = self.capacity {
            if state.sandboxes.len() >= capacity {
                return Err(ProviderError::ResourceExhausted(format!(
                    "simulated host is full ({} sandboxes)",
                    capacity
                )));
            }
        }

        let endpoint = format!("127.0.0.1:{}", state.next_port);
        state.next_port = state.next_port.wrapping_add(1).max(FIRST_PORT);
        state.sandboxes.insert(slot_id.clone(), endpoint.clone());

        info!(
            slot_id = %slot_id,
            endpoint = %endpoint,
            cpu_millicores = spec.cpu_millicores,
            memory_mb = spec.memory_mb(),
            "Simulated sandbox provisioned"
        );
        Ok(endpoint)
    }

    async fn terminate(&self, slot_id: &SlotId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.terminate_calls += 1;

        if state.unavailable {
            return Err(ProviderError::Unavailable(
                "simulated host is offline".to_string(),
            ));
        }

        if let Some(endpoint) = state.sandboxes.remove(slot_id) {
            state.unhealthy.remove(&endpoint);
            debug!(slot_id = %slot_id, "Simulated sandbox terminated");
        }
        Ok(())
    }

    async fn probe(&self, endpoint: &str) -> bool {
        let state = self.state.lock().await;
        !state.unavailable
            && !state.unhealthy.contains(endpoint)
            && state.sandboxes.values().any(|e| e == endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provision_assigns_distinct_endpoints() {
        let provider = InMemoryProvider::new();
        let spec = ResourceSpec::default();

        let a = provider.provision(&SlotId::generate(), &spec).await.unwrap();
        let b = provider.provision(&SlotId::generate(), &spec).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(provider.active_count().await, 2);
        assert!(provider.probe(&a).await);
    }

    #[tokio::test]
    async fn test_capacity_limit_reports_resource_exhausted() {
        let provider = InMemoryProvider::new().with_capacity(1);
        let spec = ResourceSpec::default();

        provider.provision(&SlotId::generate(), &spec).await.unwrap();
        let err = provider
            .provision(&SlotId::generate(), &spec)
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let provider = InMemoryProvider::new();
        let slot_id = SlotId::generate();
        let endpoint = provider
            .provision(&slot_id, &ResourceSpec::default())
            .await
            .unwrap();

        provider.terminate(&slot_id).await.unwrap();
        provider.terminate(&slot_id).await.unwrap();

        assert_eq!(provider.active_count().await, 0);
        assert_eq!(provider.terminate_calls().await, 2);
        assert!(!provider.probe(&endpoint).await);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let provider = InMemoryProvider::new();
        provider
            .fail_next_provision(ProviderError::ProvisionTimeout(1))
            .await;
        let slot_id = SlotId::generate();

        assert!(provider
            .provision(&slot_id, &ResourceSpec::default())
            .await
            .is_err());
        assert!(provider
            .provision(&slot_id, &ResourceSpec::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_marked_endpoint_fails_probe() {
        let provider = InMemoryProvider::new();
        let endpoint = provider
            .provision(&SlotId::generate(), &ResourceSpec::default())
            .await
            .unwrap();

        provider.mark_unhealthy(&endpoint).await;
        assert!(!provider.probe(&endpoint).await);
    }
}
