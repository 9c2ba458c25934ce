// ABOUTME: Tests for the scheduler client against a mocked scheduling service
// ABOUTME: Covers lease parsing, 503 retry, protocol errors and transport retry exhaustion

use sandpool_client::{AcquireOptions, ClientConfig, ClientError, SchedulerClient};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_client(base_url: &str, max_retries: u32) -> SchedulerClient {
    SchedulerClient::new(ClientConfig {
        base_url: base_url.to_string(),
        request_timeout: Duration::from_secs(5),
        max_retries,
        unavailable_delay: Duration::from_millis(10),
        backoff_step: Duration::from_millis(5),
    })
    .unwrap()
}

fn lease_body() -> serde_json::Value {
    json!({
        "success": true,
        "data": {
            "slot_id": "slot-abc",
            "endpoint": "10.0.0.5:6060",
            "owner_id": "worker-1",
            "expires_at": "2026-01-01T12:00:00Z"
        }
    })
}

fn error_body(code: &str) -> serde_json::Value {
    json!({
        "success": false,
        "error": {"code": code, "message": "refused"},
        "request_id": "req-1"
    })
}

#[tokio::test]
async fn test_acquire_parses_lease() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/acquire"))
        .and(body_partial_json(json!({
            "owner_id": "worker-1",
            "lease_duration_seconds": 600
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(lease_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server.uri(), 3);
    let lease = client
        .acquire(
            "worker-1",
            AcquireOptions {
                lease: Some(Duration::from_secs(600)),
                wait_timeout: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(lease.slot_id, "slot-abc");
    assert_eq!(lease.endpoint, "10.0.0.5:6060");
    assert_eq!(lease.owner_id, "worker-1");
}

#[tokio::test]
async fn test_acquire_retries_saturated_pool() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/acquire"))
        .respond_with(ResponseTemplate::new(503).set_body_json(error_body("POOL_EXHAUSTED")))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/acquire"))
        .respond_with(ResponseTemplate::new(200).set_body_json(lease_body()))
        .mount(&server)
        .await;

    let client = fast_client(&server.uri(), 5);
    let lease = client
        .acquire("worker-1", AcquireOptions::default())
        .await
        .unwrap();
    assert_eq!(lease.slot_id, "slot-abc");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
}

#[tokio::test]
async fn test_acquire_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/acquire"))
        .respond_with(ResponseTemplate::new(503).set_body_json(error_body("POOL_EXHAUSTED")))
        .expect(3)
        .mount(&server)
        .await;

    let client = fast_client(&server.uri(), 3);
    let err = client
        .acquire("worker-1", AcquireOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RetriesExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn test_protocol_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/acquire"))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body("VALIDATION_ERROR")))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server.uri(), 5);
    let err = client
        .acquire("", AcquireOptions::default())
        .await
        .unwrap_err();
    match err {
        ClientError::Api { status, code, .. } => {
            assert_eq!(status, 400);
            assert_eq!(code, "VALIDATION_ERROR");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_scheduler_exhausts_retries() {
    // Nothing listens on the discard port
    let client = fast_client("http://127.0.0.1:9", 2);
    let err = client
        .acquire("worker-1", AcquireOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::RetriesExhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn test_release_conflict_surfaces_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/release"))
        .and(body_partial_json(json!({"slot_id": "slot-abc", "owner_id": "worker-2"})))
        .respond_with(ResponseTemplate::new(409).set_body_json(error_body("LEASE_MISMATCH")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/release"))
        .and(body_partial_json(json!({"slot_id": "slot-abc", "owner_id": "worker-1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "data": {"released": true}})),
        )
        .mount(&server)
        .await;

    let client = fast_client(&server.uri(), 1);
    let err = client.release("slot-abc", "worker-2").await.unwrap_err();
    assert_eq!(err.status(), Some(409));
    assert!(client.release("slot-abc", "worker-1").await.is_ok());
}

#[tokio::test]
async fn test_health_and_scale() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "status": "healthy",
                "version": "0.1.0",
                "session_root": "/mnt/sessions",
                "backend": "memory",
                "baseline_size": 2,
                "max_size": 4,
                "total": 3,
                "provisioning": 0,
                "free": 1,
                "allocated": 2,
                "unhealthy": 0,
                "draining": 0,
                "waiters": 0,
                "accepting": true,
                "uptime_secs": 42,
                "stats": {
                    "total_created": 3,
                    "total_allocated": 5,
                    "total_released": 3,
                    "total_expired": 0,
                    "total_unhealthy": 0,
                    "total_destroyed": 0,
                    "total_failed": 0
                }
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/scale"))
        .and(body_partial_json(json!({"baseline_size": 4})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"previous_baseline": 2, "baseline_size": 4, "provisioning": 1, "drained": 0}
        })))
        .mount(&server)
        .await;

    let client = fast_client(&server.uri(), 1);
    let health = client.health().await.unwrap();
    assert_eq!(health.allocated, 2);
    assert_eq!(health.session_root.as_deref(), Some("/mnt/sessions"));
    assert_eq!(health.stats.total_allocated, 5);

    let scaled = client.scale(4).await.unwrap();
    assert_eq!(scaled.previous_baseline, 2);
    assert_eq!(scaled.provisioning, 1);
}
