// ABOUTME: Wire types exchanged with the scheduling service
// ABOUTME: Request bodies, lease and pool health payloads and the response envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub(crate) struct AcquireRequest<'a> {
    pub owner_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ReleaseRequest<'a> {
    pub slot_id: &'a str,
    pub owner_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ScaleRequest {
    pub baseline_size: usize,
}

/// A sandbox leased to this worker
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LeaseInfo {
    pub slot_id: String,
    /// host:port the worker talks to directly
    pub endpoint: String,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Released {
    pub released: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PoolCounters {
    pub total_created: u64,
    pub total_allocated: u64,
    pub total_released: u64,
    pub total_expired: u64,
    pub total_unhealthy: u64,
    pub total_destroyed: u64,
    pub total_failed: u64,
}

/// Pool occupancy as reported by `GET /api/health`
#[derive(Debug, Clone, Deserialize)]
pub struct PoolHealth {
    pub status: String,
    pub version: String,
    #[serde(default)]
    pub session_root: Option<String>,
    pub backend: String,
    pub baseline_size: usize,
    pub max_size: usize,
    pub total: usize,
    pub provisioning: usize,
    pub free: usize,
    pub allocated: usize,
    pub unhealthy: usize,
    pub draining: usize,
    pub waiters: usize,
    pub accepting: bool,
    pub uptime_secs: u64,
    pub stats: PoolCounters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlotSummary {
    pub slot_id: String,
    pub state: String,
    pub endpoint: Option<String>,
    pub owner_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub cpu_millicores: u32,
    pub memory_mb: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SlotList {
    pub slots: Vec<SlotSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScaleResult {
    pub previous_baseline: usize,
    pub baseline_size: usize,
    pub provisioning: usize,
    pub drained: usize,
}

/// Error detail returned by the service
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorDetail,
}
