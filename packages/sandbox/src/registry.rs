// ABOUTME: Slot registry holding every sandbox slot and its lifecycle state
// ABOUTME: All transitions are plain synchronous methods applied under the pool lock

use crate::types::{Endpoint, ResourceSpec, SlotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Provisioning,
    Free,
    Allocated,
    Unhealthy,
    Draining,
}

impl SlotState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Free => "free",
            Self::Allocated => "allocated",
            Self::Unhealthy => "unhealthy",
            Self::Draining => "draining",
        }
    }
}

/// Exclusive, time-bounded grant of one slot to one owner.
///
/// A plain value handed to the caller; presenting it back is the only way to
/// release the slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub slot_id: SlotId,
    pub owner_id: String,
    pub endpoint: Endpoint,
    pub expires_at: DateTime<Utc>,
    pub(crate) deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct SandboxSlot {
    pub id: SlotId,
    pub state: SlotState,
    pub endpoint: Option<Endpoint>,
    pub resource_spec: ResourceSpec,
    pub owner_id: Option<String>,
    pub lease_expiry: Option<Instant>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Last successful readiness or liveness probe
    pub last_health_check: Option<Instant>,
    pub created_at: DateTime<Utc>,
    pub allocated_at: Option<DateTime<Utc>>,
    /// When the slot last became Free
    pub idle_since: Option<Instant>,
    pub last_error: Option<String>,
    /// A lifecycle controller call is running for this slot
    pub lifecycle_in_flight: bool,
}

impl SandboxSlot {
    fn provisioning(id: SlotId, resource_spec: ResourceSpec) -> Self {
        Self {
            id,
            state: SlotState::Provisioning,
            endpoint: None,
            resource_spec,
            owner_id: None,
            lease_expiry: None,
            lease_expires_at: None,
            last_health_check: None,
            created_at: Utc::now(),
            allocated_at: None,
            idle_since: None,
            last_error: None,
            lifecycle_in_flight: true,
        }
    }

    pub fn is_lease_expired(&self, now: Instant) -> bool {
        self.state == SlotState::Allocated && self.lease_expiry.is_some_and(|expiry| now > expiry)
    }

    fn clear_lease(&mut self) {
        self.owner_id = None;
        self.lease_expiry = None;
        self.lease_expires_at = None;
        self.allocated_at = None;
    }

    pub(crate) fn mark_ready(&mut self, endpoint: Endpoint, now: Instant) {
        self.state = SlotState::Free;
        self.endpoint = Some(endpoint);
        self.last_health_check = Some(now);
        self.idle_since = Some(now);
        self.last_error = None;
        self.lifecycle_in_flight = false;
    }

    pub(crate) fn free(&mut self, now: Instant) {
        self.clear_lease();
        self.state = SlotState::Free;
        self.idle_since = Some(now);
    }

    pub(crate) fn mark_unhealthy(&mut self, reason: impl Into<String>) {
        self.clear_lease();
        self.state = SlotState::Unhealthy;
        self.idle_since = None;
        self.last_error = Some(reason.into());
    }

    /// Move to Draining and claim the slot for a termination call
    pub(crate) fn start_draining(&mut self) {
        self.clear_lease();
        self.state = SlotState::Draining;
        self.idle_since = None;
        self.lifecycle_in_flight = true;
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            slot_id: self.id.clone(),
            state: self.state,
            endpoint: self.endpoint.clone(),
            owner_id: self.owner_id.clone(),
            lease_expires_at: self.lease_expires_at,
            allocated_at: self.allocated_at,
            created_at: self.created_at,
            cpu_millicores: self.resource_spec.cpu_millicores,
            memory_mb: self.resource_spec.memory_mb(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only listing entry for a slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotView {
    pub slot_id: SlotId,
    pub state: SlotState,
    pub endpoint: Option<Endpoint>,
    pub owner_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub cpu_millicores: u32,
    pub memory_mb: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub total: usize,
    pub provisioning: usize,
    pub free: usize,
    pub allocated: usize,
    pub unhealthy: usize,
    pub draining: usize,
}

impl SlotCounts {
    /// Slots that are, or will soon be, usable
    pub fn live(&self) -> usize {
        self.provisioning + self.free + self.allocated
    }
}

/// Monotonic lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_created: u64,
    pub total_allocated: u64,
    pub total_released: u64,
    pub total_expired: u64,
    pub total_unhealthy: u64,
    pub total_destroyed: u64,
    pub total_failed: u64,
}

/// Why a release was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseRefusal {
    NotFound,
    LeaseMismatch,
}

#[derive(Debug)]
pub struct SlotRegistry {
    slots: HashMap<SlotId, SandboxSlot>,
    pub baseline_size: usize,
    pub max_size: usize,
    pub stats: PoolStats,
}

impl SlotRegistry {
    pub fn new(baseline_size: usize, max_size: usize) -> Self {
        Self {
            slots: HashMap::new(),
            baseline_size,
            max_size,
            stats: PoolStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: &SlotId) -> Option<&SandboxSlot> {
        self.slots.get(id)
    }

    pub fn get_mut(&mut self, id: &SlotId) -> Option<&mut SandboxSlot> {
        self.slots.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SandboxSlot> {
        self.slots.values()
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.len() < self.max_size
    }

    /// Room left under the hard ceiling
    pub fn headroom(&self) -> usize {
        self.max_size.saturating_sub(self.slots.len())
    }

    pub fn counts(&self) -> SlotCounts {
        let mut counts = SlotCounts {
            total: self.slots.len(),
            ..Default::default()
        };
        for slot in self.slots.values() {
            match slot.state {
                SlotState::Provisioning => counts.provisioning += 1,
                SlotState::Free => counts.free += 1,
                SlotState::Allocated => counts.allocated += 1,
                SlotState::Unhealthy => counts.unhealthy += 1,
                SlotState::Draining => counts.draining += 1,
            }
        }
        counts
    }

    /// Reserve a new Provisioning slot, or `None` at the ceiling
    pub fn reserve(&mut self, spec: ResourceSpec) -> Option<SlotId> {
        if !self.has_capacity() {
            return None;
        }
        let id = SlotId::generate();
        self.slots
            .insert(id.clone(), SandboxSlot::provisioning(id.clone(), spec));
        Some(id)
    }

    /// Free slot that has been idle the longest
    pub fn first_free(&self) -> Option<SlotId> {
        self.slots
            .values()
            .filter(|slot| slot.state == SlotState::Free)
            .min_by_key(|slot| slot.idle_since)
            .map(|slot| slot.id.clone())
    }

    /// Transition a Free slot to Allocated for `owner_id`
    pub fn allocate(
        &mut self,
        id: &SlotId,
        owner_id: &str,
        lease: Duration,
        now: Instant,
    ) -> Option<Lease> {
        let slot = self.slots.get_mut(id)?;
        if slot.state != SlotState::Free {
            return None;
        }
        let endpoint = slot.endpoint.clone()?;

        let deadline = now.checked_add(lease)?;
        let expires_at = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        slot.state = SlotState::Allocated;
        slot.owner_id = Some(owner_id.to_string());
        slot.lease_expiry = Some(deadline);
        slot.lease_expires_at = Some(expires_at);
        slot.allocated_at = Some(Utc::now());
        slot.idle_since = None;
        self.stats.total_allocated += 1;

        Some(Lease {
            slot_id: id.clone(),
            owner_id: owner_id.to_string(),
            endpoint,
            expires_at,
            deadline,
        })
    }

    /// Validate that `owner_id` holds `id`, clearing the lease on success.
    /// The slot is left Allocated without an owner for the caller to recycle.
    pub fn take_lease(
        &mut self,
        id: &SlotId,
        owner_id: &str,
    ) -> Result<&mut SandboxSlot, ReleaseRefusal> {
        let slot = self.slots.get_mut(id).ok_or(ReleaseRefusal::NotFound)?;
        if slot.state != SlotState::Allocated || slot.owner_id.as_deref() != Some(owner_id) {
            return Err(ReleaseRefusal::LeaseMismatch);
        }
        slot.clear_lease();
        self.stats.total_released += 1;
        Ok(slot)
    }

    pub fn remove(&mut self, id: &SlotId) -> Option<SandboxSlot> {
        self.slots.remove(id)
    }

    pub fn ids_where(&self, predicate: impl Fn(&SandboxSlot) -> bool) -> Vec<SlotId> {
        self.slots
            .values()
            .filter(|slot| predicate(slot))
            .map(|slot| slot.id.clone())
            .collect()
    }

    pub fn views(&self) -> Vec<SlotView> {
        let mut views: Vec<SlotView> = self.slots.values().map(SandboxSlot::view).collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.slot_id.cmp(&b.slot_id)));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_free(n: usize) -> (SlotRegistry, Vec<SlotId>) {
        let mut registry = SlotRegistry::new(n, n + 2);
        let now = Instant::now();
        let ids = (0..n)
            .map(|i| {
                let id = registry.reserve(ResourceSpec::default()).unwrap();
                registry
                    .get_mut(&id)
                    .unwrap()
                    .mark_ready(format!("127.0.0.1:{}", 7000 + i), now);
                id
            })
            .collect();
        (registry, ids)
    }

    #[test]
    fn test_reserve_respects_ceiling() {
        let mut registry = SlotRegistry::new(1, 2);
        assert!(registry.reserve(ResourceSpec::default()).is_some());
        assert!(registry.reserve(ResourceSpec::default()).is_some());
        assert!(registry.reserve(ResourceSpec::default()).is_none());
        assert_eq!(registry.counts().provisioning, 2);
    }

    #[test]
    fn test_allocate_stamps_owner_and_expiry() {
        let (mut registry, ids) = registry_with_free(1);
        let now = Instant::now();

        let lease = registry
            .allocate(&ids[0], "worker-1", Duration::from_secs(30), now)
            .unwrap();

        let slot = registry.get(&ids[0]).unwrap();
        assert_eq!(slot.state, SlotState::Allocated);
        assert_eq!(slot.owner_id.as_deref(), Some("worker-1"));
        assert!(lease.deadline > now);
        assert!(lease.expires_at > Utc::now());
        assert_eq!(registry.stats.total_allocated, 1);
    }

    #[test]
    fn test_allocated_slot_cannot_be_allocated_twice() {
        let (mut registry, ids) = registry_with_free(1);
        let now = Instant::now();

        assert!(registry
            .allocate(&ids[0], "a", Duration::from_secs(30), now)
            .is_some());
        assert!(registry
            .allocate(&ids[0], "b", Duration::from_secs(30), now)
            .is_none());
    }

    #[test]
    fn test_overflowing_lease_leaves_slot_free() {
        let (mut registry, ids) = registry_with_free(1);

        assert!(registry
            .allocate(&ids[0], "a", Duration::from_secs(u64::MAX), Instant::now())
            .is_none());
        assert_eq!(registry.get(&ids[0]).unwrap().state, SlotState::Free);
    }

    #[test]
    fn test_take_lease_checks_owner() {
        let (mut registry, ids) = registry_with_free(1);
        registry
            .allocate(&ids[0], "a", Duration::from_secs(30), Instant::now())
            .unwrap();

        assert_eq!(
            registry.take_lease(&ids[0], "b").err(),
            Some(ReleaseRefusal::LeaseMismatch)
        );
        assert_eq!(
            registry.take_lease(&SlotId::from("missing"), "a").err(),
            Some(ReleaseRefusal::NotFound)
        );
        assert!(registry.take_lease(&ids[0], "a").is_ok());
        assert_eq!(registry.stats.total_released, 1);
    }

    #[test]
    fn test_counts_by_state() {
        let (mut registry, ids) = registry_with_free(3);
        registry
            .allocate(&ids[0], "a", Duration::from_secs(30), Instant::now())
            .unwrap();
        registry.get_mut(&ids[1]).unwrap().mark_unhealthy("probe failed");

        let counts = registry.counts();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.free, 1);
        assert_eq!(counts.allocated, 1);
        assert_eq!(counts.unhealthy, 1);
        assert_eq!(counts.live(), 2);
    }

    #[test]
    fn test_lease_expiry_detection() {
        let (mut registry, ids) = registry_with_free(1);
        let now = Instant::now();
        registry
            .allocate(&ids[0], "a", Duration::from_secs(10), now)
            .unwrap();

        let slot = registry.get(&ids[0]).unwrap();
        assert!(!slot.is_lease_expired(now + Duration::from_secs(5)));
        assert!(slot.is_lease_expired(now + Duration::from_secs(11)));
    }
}
