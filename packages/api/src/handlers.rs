// ABOUTME: HTTP request handlers for sandbox leasing and pool administration
// ABOUTME: Validates worker requests and translates them into pool manager calls

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use sandpool_sandbox::{Lease, PoolSnapshot, ScaleOutcome, SlotId, SlotView};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ApiResult, AppError};
use crate::extract::ValidJson;
use crate::response::{ok, ApiResponse};
use crate::AppState;

/// Longest accepted owner id
pub const MAX_OWNER_ID_LEN: usize = 256;

/// Margin kept between a queued acquire and the request timeout
const WAIT_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub owner_id: String,
    #[serde(default)]
    pub lease_duration_seconds: Option<u64>,
    #[serde(default)]
    pub wait_timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct AcquireResponse {
    pub slot_id: SlotId,
    pub endpoint: String,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

impl From<Lease> for AcquireResponse {
    fn from(lease: Lease) -> Self {
        Self {
            slot_id: lease.slot_id,
            endpoint: lease.endpoint,
            owner_id: lease.owner_id,
            expires_at: lease.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub slot_id: SlotId,
    pub owner_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_root: Option<String>,
    #[serde(flatten)]
    pub pool: PoolSnapshot,
}

#[derive(Debug, Serialize)]
pub struct SlotsResponse {
    pub slots: Vec<SlotView>,
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub baseline_size: usize,
}

fn validate_owner(owner_id: &str) -> ApiResult<&str> {
    let owner_id = owner_id.trim();
    if owner_id.is_empty() {
        return Err(AppError::validation("owner_id is required"));
    }
    if owner_id.chars().count() > MAX_OWNER_ID_LEN {
        return Err(AppError::validation(format!(
            "owner_id must be at most {} characters",
            MAX_OWNER_ID_LEN
        )));
    }
    Ok(owner_id)
}

/// Longest a request may sit in the waiter queue
pub(crate) fn clamp_wait(wait: Duration, request_timeout: Duration) -> Duration {
    let ceiling = request_timeout
        .saturating_sub(WAIT_MARGIN)
        .max(request_timeout / 2);
    wait.min(ceiling)
}

/// POST /api/acquire - Lease a sandbox, waiting for one if the pool is busy
pub async fn acquire(
    State(state): State<AppState>,
    ValidJson(request): ValidJson<AcquireRequest>,
) -> ApiResult<Json<ApiResponse<AcquireResponse>>> {
    let owner_id = validate_owner(&request.owner_id)?;

    let settings = state.pool.settings();
    let lease = match request.lease_duration_seconds {
        Some(0) => {
            return Err(AppError::validation(
                "lease_duration_seconds must be greater than zero",
            ))
        }
        Some(secs) if Duration::from_secs(secs) > settings.max_lease => {
            return Err(AppError::validation(format!(
                "lease_duration_seconds must not exceed {}",
                settings.max_lease.as_secs()
            )))
        }
        Some(secs) => Duration::from_secs(secs),
        None => settings.default_lease,
    };

    let requested_wait = request
        .wait_timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(settings.default_wait_timeout);
    let wait = clamp_wait(requested_wait, state.request_timeout);
    if wait < requested_wait {
        debug!(
            owner_id = %owner_id,
            requested_secs = requested_wait.as_secs(),
            clamped_secs = wait.as_secs_f64(),
            "Clamped acquire wait to request timeout"
        );
    }

    let granted = state.pool.acquire(owner_id, Some(lease), Some(wait)).await?;
    info!(
        slot_id = %granted.slot_id,
        owner_id = %granted.owner_id,
        expires_at = %granted.expires_at,
        "Lease granted"
    );
    Ok(ok(AcquireResponse::from(granted)))
}

/// POST /api/release - Return a leased sandbox to the pool
pub async fn release(
    State(state): State<AppState>,
    ValidJson(request): ValidJson<ReleaseRequest>,
) -> ApiResult<Json<ApiResponse<ReleaseResponse>>> {
    let owner_id = validate_owner(&request.owner_id)?;
    if request.slot_id.as_str().is_empty() {
        return Err(AppError::validation("slot_id is required"));
    }

    state.pool.release(&request.slot_id, owner_id)?;
    info!(slot_id = %request.slot_id, owner_id = %owner_id, "Lease released");
    Ok(ok(ReleaseResponse { released: true }))
}

/// GET /api/health - Pool occupancy and lifetime counters
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<ApiResponse<HealthResponse>>> {
    let pool = state.pool.snapshot()?;
    let status = if pool.accepting { "healthy" } else { "draining" };
    Ok(ok(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        session_root: state.session_root.clone(),
        pool,
    }))
}

/// GET /api/slots - Every slot and its current state
pub async fn list_slots(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<SlotsResponse>>> {
    let slots = state.pool.slots()?;
    Ok(ok(SlotsResponse { slots }))
}

/// POST /api/scale - Change the baseline pool size
pub async fn scale(
    State(state): State<AppState>,
    ValidJson(request): ValidJson<ScaleRequest>,
) -> ApiResult<Json<ApiResponse<ScaleOutcome>>> {
    info!(baseline_size = request.baseline_size, "Scale requested");
    let outcome = state.pool.scale(request.baseline_size).await?;
    Ok(ok(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(60, 300, 60)]
    #[case(600, 300, 299)]
    #[case(10, 1, 0)]
    fn test_clamp_wait(#[case] wait: u64, #[case] timeout: u64, #[case] expected: u64) {
        let clamped = clamp_wait(Duration::from_secs(wait), Duration::from_secs(timeout));
        assert_eq!(clamped.as_secs(), expected);
        assert!(clamped < Duration::from_secs(timeout));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn test_empty_owner_rejected(#[case] owner: &str) {
        assert!(matches!(validate_owner(owner), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_owner_length_limit() {
        let at_limit = "w".repeat(MAX_OWNER_ID_LEN);
        assert_eq!(validate_owner(&at_limit).unwrap(), at_limit);

        let too_long = "w".repeat(MAX_OWNER_ID_LEN + 1);
        assert!(validate_owner(&too_long).is_err());
    }

    #[test]
    fn test_owner_is_trimmed() {
        assert_eq!(validate_owner("  worker-7 ").unwrap(), "worker-7");
    }
}
