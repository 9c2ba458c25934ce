// ABOUTME: Pool manager granting exclusive sandbox leases to rollout workers
// ABOUTME: Serves acquire/release in FIFO order, provisions within max size and drains on scale or shutdown

use crate::providers::{ProviderError, ProvisioningController};
use crate::registry::{
    Lease, PoolStats, ReleaseRefusal, SlotCounts, SlotRegistry, SlotState, SlotView,
};
use crate::settings::{PoolSettings, RecyclePolicy, SettingsError};
use crate::types::{Endpoint, ResourceSpec, SlotId};
use futures::future::join_all;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("No sandbox became available before the wait timeout")]
    PoolExhausted,

    #[error("Sandbox did not become ready within {0} seconds")]
    ProvisionTimeout(u64),

    #[error("Host cannot satisfy resource request: {0}")]
    ResourceExhausted(String),

    #[error("Slot {0} is not leased to this owner")]
    LeaseMismatch(SlotId),

    #[error("Slot not found: {0}")]
    NotFound(SlotId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Requested baseline {requested} exceeds max size {max}")]
    InvalidScale { requested: usize, max: usize },

    #[error("Invalid pool settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Slot registry lock poisoned")]
    RegistryPoisoned,
}

impl From<ProviderError> for PoolError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ProvisionTimeout(secs) => Self::ProvisionTimeout(secs),
            ProviderError::ResourceExhausted(reason) => Self::ResourceExhausted(reason),
            other => Self::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub backend: String,
    pub baseline_size: usize,
    pub max_size: usize,
    #[serde(flatten)]
    pub counts: SlotCounts,
    pub waiters: usize,
    pub accepting: bool,
    pub uptime_secs: u64,
    pub stats: PoolStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleOutcome {
    pub previous_baseline: usize,
    pub baseline_size: usize,
    /// Slots whose provisioning was started
    pub provisioning: usize,
    /// Free slots drained and terminated
    pub drained: usize,
}

struct Waiter {
    id: u64,
    owner_id: String,
    lease: Duration,
    tx: oneshot::Sender<Result<Lease>>,
}

struct PoolState {
    registry: SlotRegistry,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    accepting: bool,
}

impl PoolState {
    /// Hand Free slots to waiters in arrival order
    fn dispatch(&mut self, now: Instant) {
        while !self.waiters.is_empty() {
            let Some(slot_id) = self.registry.first_free() else {
                break;
            };
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.tx.is_closed() {
                continue;
            }

            let Some(lease) = self
                .registry
                .allocate(&slot_id, &waiter.owner_id, waiter.lease, now)
            else {
                self.waiters.push_front(waiter);
                break;
            };

            debug!(slot_id = %slot_id, owner_id = %waiter.owner_id, "Slot handed to waiter");
            if waiter.tx.send(Ok(lease)).is_err() {
                if let Some(slot) = self.registry.get_mut(&slot_id) {
                    slot.free(now);
                }
            }
        }
    }

    /// Queued callers not matched by an in-flight provision
    fn uncovered_waiters(&self) -> usize {
        self.waiters
            .len()
            .saturating_sub(self.registry.counts().provisioning)
    }

    /// Reserve a provision for each uncovered caller, newest first, while
    /// headroom lasts. Returns each reserved slot with the caller it serves.
    fn cover_waiters(&mut self, spec: ResourceSpec) -> Vec<(SlotId, u64)> {
        let uncovered = self.uncovered_waiters();
        let sponsors: Vec<u64> = self.waiters.iter().rev().take(uncovered).map(|w| w.id).collect();
        sponsors
            .into_iter()
            .map_while(|id| self.registry.reserve(spec).map(|slot_id| (slot_id, id)))
            .collect()
    }

    fn remove_waiter(&mut self, id: u64) -> Option<Waiter> {
        let position = self.waiters.iter().position(|w| w.id == id)?;
        self.waiters.remove(position)
    }

    /// Mark every settled slot Draining and claim it for termination
    fn claim_all_for_drain(&mut self) -> Vec<SlotId> {
        let ids = self
            .registry
            .ids_where(|slot| slot.state != SlotState::Provisioning && !slot.lifecycle_in_flight);
        for id in &ids {
            if let Some(slot) = self.registry.get_mut(id) {
                slot.start_draining();
            }
        }
        ids
    }
}

/// Owns the slot registry and every transition applied to it
pub struct PoolManager {
    controller: Arc<dyn ProvisioningController>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    provision_permits: Semaphore,
    fatal: watch::Sender<Option<String>>,
    started_at: Instant,
}

impl PoolManager {
    pub fn new(
        controller: Arc<dyn ProvisioningController>,
        settings: PoolSettings,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let state = PoolState {
            registry: SlotRegistry::new(settings.baseline_size, settings.max_size),
            waiters: VecDeque::new(),
            next_waiter_id: 0,
            accepting: true,
        };
        let (fatal, _) = watch::channel(None);

        Ok(Arc::new(Self {
            controller,
            provision_permits: Semaphore::new(settings.max_concurrent_provisions),
            settings,
            state: Mutex::new(state),
            fatal,
            started_at: Instant::now(),
        }))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn controller(&self) -> &Arc<dyn ProvisioningController> {
        &self.controller
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|_| {
            self.raise_fatal("slot registry lock poisoned");
            PoolError::RegistryPoisoned
        })
    }

    fn raise_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "Fatal pool condition");
        self.fatal.send_replace(Some(reason));
    }

    /// Resolves to `Some(reason)` once the pool can no longer operate
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().map(|state| state.accepting).unwrap_or(false)
    }

    /// Lease a sandbox for `owner_id`, waiting up to `wait_timeout` for one
    pub async fn acquire(
        self: &Arc<Self>,
        owner_id: &str,
        lease: Option<Duration>,
        wait_timeout: Option<Duration>,
    ) -> Result<Lease> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(PoolError::InvalidRequest(
                "owner_id must not be empty".to_string(),
            ));
        }
        let lease = lease.unwrap_or(self.settings.default_lease);
        if lease.is_zero() || lease > self.settings.max_lease {
            return Err(PoolError::InvalidRequest(format!(
                "lease duration must be between 1 and {} seconds",
                self.settings.max_lease.as_secs()
            )));
        }
        let wait_timeout = wait_timeout.unwrap_or(self.settings.default_wait_timeout);

        let (waiter_id, rx, reserved) = {
            let mut state = self.lock()?;
            if !state.accepting {
                return Err(PoolError::ShuttingDown);
            }
            let now = Instant::now();

            // Queued callers go first
            if state.waiters.is_empty() {
                if let Some(slot_id) = state.registry.first_free() {
                    if let Some(granted) = state.registry.allocate(&slot_id, owner_id, lease, now) {
                        info!(slot_id = %slot_id, owner_id = %owner_id, "Slot allocated");
                        return Ok(granted);
                    }
                }
            }

            let (tx, rx) = oneshot::channel();
            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter {
                id: waiter_id,
                owner_id: owner_id.to_string(),
                lease,
                tx,
            });

            let provisioning = state.registry.counts().provisioning;
            let reserved = if provisioning < state.waiters.len() {
                state.registry.reserve(self.settings.resource_spec)
            } else {
                None
            };
            (waiter_id, rx, reserved)
        };

        if let Some(slot_id) = reserved {
            debug!(slot_id = %slot_id, owner_id = %owner_id, "No free slot, provisioning one");
            self.spawn_provision(slot_id, Some(waiter_id));
        }

        let mut pending = PendingAcquire {
            manager: Arc::as_ref(self),
            waiter_id,
            rx,
            settled: false,
        };

        match tokio::time::timeout(wait_timeout, &mut pending.rx).await {
            Ok(Ok(result)) => {
                pending.settled = true;
                if let Ok(granted) = &result {
                    info!(slot_id = %granted.slot_id, owner_id = %owner_id, "Slot allocated after wait");
                }
                result
            }
            Ok(Err(_)) => {
                pending.settled = true;
                Err(PoolError::ShuttingDown)
            }
            Err(_) => {
                pending.abandon();
                warn!(owner_id = %owner_id, wait_secs = wait_timeout.as_secs_f64(), "Acquire timed out");
                Err(PoolError::PoolExhausted)
            }
        }
    }

    /// Return a granted lease nobody will read back to the pool
    fn return_grant(&self, lease: Lease) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        let now = Instant::now();
        if let Some(slot) = state.registry.get_mut(&lease.slot_id) {
            if slot.state == SlotState::Allocated
                && slot.owner_id.as_deref() == Some(lease.owner_id.as_str())
            {
                debug!(slot_id = %lease.slot_id, "Returning unclaimed grant to pool");
                slot.free(now);
            }
        }
        state.dispatch(now);
    }

    /// End a lease early. The slot is recycled per the configured policy.
    pub fn release(self: &Arc<Self>, slot_id: &SlotId, owner_id: &str) -> Result<()> {
        let replace = {
            let mut state = self.lock()?;
            if !state.accepting {
                return Err(PoolError::ShuttingDown);
            }
            let now = Instant::now();
            let slot = state
                .registry
                .take_lease(slot_id, owner_id)
                .map_err(|refusal| match refusal {
                    ReleaseRefusal::NotFound => PoolError::NotFound(slot_id.clone()),
                    ReleaseRefusal::LeaseMismatch => PoolError::LeaseMismatch(slot_id.clone()),
                })?;

            match self.settings.recycle {
                RecyclePolicy::Reuse => {
                    slot.free(now);
                    state.dispatch(now);
                    false
                }
                RecyclePolicy::Replace => {
                    slot.start_draining();
                    true
                }
            }
        };

        info!(slot_id = %slot_id, owner_id = %owner_id, "Slot released");

        if replace {
            let manager = Arc::clone(self);
            let slot_id = slot_id.clone();
            tokio::spawn(async move {
                manager.destroy(&slot_id).await;
                if let Err(e) = manager.replenish() {
                    warn!(error = %e, "Failed to schedule replacement slot");
                }
            });
        }
        Ok(())
    }

    /// Provision enough slots to restore the baseline and cover queued callers
    pub fn replenish(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let reserved: Vec<SlotId> = {
            let mut state = self.lock()?;
            if !state.accepting {
                return Ok(Vec::new());
            }
            let counts = state.registry.counts();
            let below_baseline = state.registry.baseline_size.saturating_sub(counts.live());
            let uncovered = state.waiters.len().saturating_sub(counts.provisioning);
            let wanted = below_baseline.max(uncovered).min(state.registry.headroom());

            (0..wanted)
                .filter_map(|_| state.registry.reserve(self.settings.resource_spec))
                .collect()
        };

        if !reserved.is_empty() {
            info!(count = reserved.len(), "Provisioning slots to restore pool size");
        }
        Ok(reserved
            .into_iter()
            .map(|slot_id| self.spawn_provision(slot_id, None))
            .collect())
    }

    /// Provision the baseline and wait until every attempt settles
    pub async fn warm_up(self: &Arc<Self>) -> Result<PoolSnapshot> {
        let handles = self.replenish()?;
        info!(count = handles.len(), "Warming up sandbox pool");

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Provisioning task panicked");
            }
        }

        let snapshot = self.snapshot()?;
        if snapshot.counts.free < snapshot.baseline_size {
            warn!(
                free = snapshot.counts.free,
                baseline = snapshot.baseline_size,
                "Pool warmed up below baseline"
            );
        }
        Ok(snapshot)
    }

    /// Change the baseline. Only Free slots are drained when shrinking.
    pub async fn scale(self: &Arc<Self>, target_baseline: usize) -> Result<ScaleOutcome> {
        let (previous, drained) = {
            let mut state = self.lock()?;
            if !state.accepting {
                return Err(PoolError::ShuttingDown);
            }
            if target_baseline > state.registry.max_size {
                return Err(PoolError::InvalidScale {
                    requested: target_baseline,
                    max: state.registry.max_size,
                });
            }

            let previous = state.registry.baseline_size;
            state.registry.baseline_size = target_baseline;

            let excess = state.registry.counts().live().saturating_sub(target_baseline);
            let mut free: Vec<(Option<Instant>, SlotId)> = state
                .registry
                .iter()
                .filter(|slot| slot.state == SlotState::Free)
                .map(|slot| (slot.idle_since, slot.id.clone()))
                .collect();
            free.sort();

            let drained: Vec<SlotId> = free.into_iter().take(excess).map(|(_, id)| id).collect();
            for id in &drained {
                if let Some(slot) = state.registry.get_mut(id) {
                    slot.start_draining();
                }
            }
            (previous, drained)
        };

        let provisioning = self.replenish()?.len();
        join_all(drained.iter().map(|id| self.destroy(id))).await;

        info!(
            previous_baseline = previous,
            baseline = target_baseline,
            provisioning,
            drained = drained.len(),
            "Pool rescaled"
        );
        Ok(ScaleOutcome {
            previous_baseline: previous,
            baseline_size: target_baseline,
            provisioning,
            drained: drained.len(),
        })
    }

    pub fn snapshot(&self) -> Result<PoolSnapshot> {
        let state = self.lock()?;
        Ok(PoolSnapshot {
            backend: self.controller.name().to_string(),
            baseline_size: state.registry.baseline_size,
            max_size: state.registry.max_size,
            counts: state.registry.counts(),
            waiters: state.waiters.len(),
            accepting: state.accepting,
            uptime_secs: self.started_at.elapsed().as_secs(),
            stats: state.registry.stats,
        })
    }

    pub fn slots(&self) -> Result<Vec<SlotView>> {
        Ok(self.lock()?.registry.views())
    }

    /// Stop accepting work, fail waiters and terminate every slot
    pub async fn shutdown(&self) -> Result<()> {
        let draining = {
            let mut state = self.lock()?;
            state.accepting = false;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(Err(PoolError::ShuttingDown));
            }
            state.claim_all_for_drain()
        };

        info!(count = draining.len(), "Draining sandbox pool");
        join_all(draining.iter().map(|id| self.destroy(id))).await;

        // In-flight provisions terminate their own slots once they finish
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        loop {
            let (remaining, retry) = {
                let mut state = self.lock()?;
                let retry = state.claim_all_for_drain();
                (state.registry.len(), retry)
            };
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "Shutdown timeout reached with slots still present");
                break;
            }
            join_all(retry.iter().map(|id| self.destroy(id))).await;
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        info!("Sandbox pool drained");
        Ok(())
    }

    fn spawn_provision(self: &Arc<Self>, slot_id: SlotId, sponsor: Option<u64>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.provision_slot(slot_id, sponsor).await })
    }

    /// Drive one Provisioning slot to Free, retrying with backoff
    async fn provision_slot(self: &Arc<Self>, slot_id: SlotId, sponsor: Option<u64>) {
        let Ok(_permit) = self.provision_permits.acquire().await else {
            self.fail_provision(
                &slot_id,
                sponsor,
                ProviderError::Backend("provisioning closed".to_string()),
            )
            .await;
            return;
        };

        let spec = self.settings.resource_spec;
        let mut attempt = 0;
        let result = loop {
            if !self.is_accepting() {
                break Err(ProviderError::Backend("pool is shutting down".to_string()));
            }

            match self.controller.provision(&slot_id, &spec).await {
                Ok(endpoint) => break Ok(endpoint),
                Err(e) if e.is_retryable() && attempt < self.settings.provision_retries => {
                    attempt += 1;
                    let delay = self.settings.backoff_for(attempt);
                    warn!(
                        slot_id = %slot_id,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Provisioning attempt failed, retrying"
                    );
                    if let Err(te) = self.controller.terminate(&slot_id).await {
                        warn!(slot_id = %slot_id, error = %te, "Cleanup after failed attempt failed");
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(endpoint) => self.finish_provision(&slot_id, endpoint).await,
            Err(e) => self.fail_provision(&slot_id, sponsor, e).await,
        }
    }

    async fn finish_provision(&self, slot_id: &SlotId, endpoint: Endpoint) {
        let ready = {
            let Ok(mut state) = self.lock() else {
                return;
            };
            let now = Instant::now();
            let accepting = state.accepting;

            let ready = match state.registry.get_mut(slot_id) {
                Some(slot) if accepting && slot.state == SlotState::Provisioning => {
                    slot.mark_ready(endpoint.clone(), now);
                    true
                }
                Some(slot) => {
                    slot.endpoint = Some(endpoint.clone());
                    slot.start_draining();
                    false
                }
                None => false,
            };
            state.registry.stats.total_created += 1;
            if ready {
                state.dispatch(now);
            }
            ready
        };

        if ready {
            info!(slot_id = %slot_id, endpoint = %endpoint, "Slot ready");
        } else {
            debug!(slot_id = %slot_id, "Slot finished provisioning after shutdown began");
            self.destroy(slot_id).await;
        }
    }

    /// Report a failed provision and make sure no queued caller is left
    /// counting on it
    async fn fail_provision(
        self: &Arc<Self>,
        slot_id: &SlotId,
        sponsor: Option<u64>,
        error: ProviderError,
    ) {
        error!(slot_id = %slot_id, error = %error, "Provisioning failed");
        let fatal = error.is_fatal();
        if fatal {
            self.raise_fatal(format!("host virtualization layer unavailable: {}", error));
        }

        {
            let Ok(mut state) = self.lock() else {
                return;
            };
            state.registry.stats.total_failed += 1;
            if let Some(slot) = state.registry.get_mut(slot_id) {
                slot.start_draining();
                slot.last_error = Some(error.to_string());
            }

            // The sponsor hears first; otherwise the oldest caller this
            // provision was covering does
            let notified = match sponsor.and_then(|id| state.remove_waiter(id)) {
                Some(waiter) => Some(waiter),
                None if state.uncovered_waiters() > 0 => state.waiters.pop_front(),
                None => None,
            };
            if let Some(waiter) = notified {
                debug!(owner_id = %waiter.owner_id, "Reporting provisioning failure to waiter");
                let _ = waiter.tx.send(Err(PoolError::from(error)));
            }
        }

        self.destroy(slot_id).await;
        if fatal {
            return;
        }

        let replacements = {
            let Ok(mut state) = self.lock() else {
                return;
            };
            if !state.accepting {
                return;
            }
            state.cover_waiters(self.settings.resource_spec)
        };
        for (slot_id, sponsor) in replacements {
            debug!(slot_id = %slot_id, "Provisioning replacement for queued caller");
            self.spawn_provision(slot_id, Some(sponsor));
        }
    }

    /// Terminate a claimed Draining slot and forget it once the host confirms.
    /// On failure the slot stays Draining for the health monitor to retry.
    pub(crate) async fn destroy(&self, slot_id: &SlotId) -> bool {
        let result = self.controller.terminate(slot_id).await;

        let Ok(mut state) = self.lock() else {
            return false;
        };
        match result {
            Ok(()) => {
                if let Some(slot) = state.registry.remove(slot_id) {
                    if slot.endpoint.is_some() {
                        state.registry.stats.total_destroyed += 1;
                    }
                }
                debug!(slot_id = %slot_id, "Slot terminated and removed");
                true
            }
            Err(e) => {
                warn!(slot_id = %slot_id, error = %e, "Termination failed, slot kept draining");
                if let Some(slot) = state.registry.get_mut(slot_id) {
                    slot.lifecycle_in_flight = false;
                    slot.last_error = Some(e.to_string());
                }
                drop(state);
                if e.is_fatal() {
                    self.raise_fatal(format!("host virtualization layer unavailable: {}", e));
                }
                false
            }
        }
    }

    /// Revoke every lease past its deadline
    pub(crate) fn expire_leases(&self, now: Instant) -> Result<Vec<SlotId>> {
        let mut state = self.lock()?;
        let expired = state.registry.ids_where(|slot| slot.is_lease_expired(now));
        for id in &expired {
            if let Some(slot) = state.registry.get_mut(id) {
                warn!(
                    slot_id = %id,
                    owner_id = slot.owner_id.as_deref().unwrap_or_default(),
                    "Lease expired, revoking"
                );
                slot.mark_unhealthy("lease expired");
            }
        }
        state.registry.stats.total_expired += expired.len() as u64;
        Ok(expired)
    }

    /// Free and Allocated slots whose last good probe is too old
    pub(crate) fn stale_slots(&self, now: Instant) -> Result<Vec<(SlotId, Endpoint)>> {
        let state = self.lock()?;
        let staleness = self.settings.probe_staleness;
        Ok(state
            .registry
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Free | SlotState::Allocated))
            .filter(|slot| {
                slot.last_health_check
                    .map_or(true, |at| now.saturating_duration_since(at) >= staleness)
            })
            .filter_map(|slot| slot.endpoint.clone().map(|e| (slot.id.clone(), e)))
            .collect())
    }

    /// Apply a probe outcome; returns whether the slot was marked Unhealthy
    pub(crate) fn record_probe(&self, slot_id: &SlotId, healthy: bool, now: Instant) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(slot) = state.registry.get_mut(slot_id) else {
            return Ok(false);
        };
        if !matches!(slot.state, SlotState::Free | SlotState::Allocated) {
            return Ok(false);
        }
        if healthy {
            slot.last_health_check = Some(now);
            return Ok(false);
        }

        warn!(slot_id = %slot_id, "Liveness probe failed");
        slot.mark_unhealthy("liveness probe failed");
        state.registry.stats.total_unhealthy += 1;
        Ok(true)
    }

    /// Drain Free slots above baseline that sat idle past the idle timeout
    pub(crate) fn drain_idle(&self, now: Instant) -> Result<Vec<SlotId>> {
        let Some(idle_timeout) = self.settings.idle_timeout else {
            return Ok(Vec::new());
        };

        let mut state = self.lock()?;
        let excess = state
            .registry
            .counts()
            .live()
            .saturating_sub(state.registry.baseline_size);

        let mut idle: Vec<(Instant, SlotId)> = state
            .registry
            .iter()
            .filter(|slot| slot.state == SlotState::Free)
            .filter_map(|slot| slot.idle_since.map(|since| (since, slot.id.clone())))
            .filter(|(since, _)| now.saturating_duration_since(*since) >= idle_timeout)
            .collect();
        idle.sort();

        let drained: Vec<SlotId> = idle.into_iter().take(excess).map(|(_, id)| id).collect();
        for id in &drained {
            if let Some(slot) = state.registry.get_mut(id) {
                slot.start_draining();
            }
        }
        Ok(drained)
    }

    /// Claim Unhealthy slots and stranded Draining slots for termination
    pub(crate) fn claim_for_termination(&self) -> Result<Vec<SlotId>> {
        let mut state = self.lock()?;
        let ids = state.registry.ids_where(|slot| {
            slot.state == SlotState::Unhealthy
                || (slot.state == SlotState::Draining && !slot.lifecycle_in_flight)
        });
        for id in &ids {
            if let Some(slot) = state.registry.get_mut(id) {
                slot.start_draining();
            }
        }
        Ok(ids)
    }
}

/// Waiter registration owned by an in-progress acquire.
///
/// Dropping it before a grant is read removes the registration and hands any
/// grant that raced with the cancellation back to the pool.
struct PendingAcquire<'a> {
    manager: &'a PoolManager,
    waiter_id: u64,
    rx: oneshot::Receiver<Result<Lease>>,
    settled: bool,
}

impl PendingAcquire<'_> {
    fn abandon(&mut self) {
        self.settled = true;
        if let Ok(mut state) = self.manager.lock() {
            state.remove_waiter(self.waiter_id);
        }
        // Grants are only sent under the lock, so nothing new can arrive now
        self.rx.close();
        if let Ok(Ok(lease)) = self.rx.try_recv() {
            self.manager.return_grant(lease);
        }
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.abandon();
        }
    }
}
