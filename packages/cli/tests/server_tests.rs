// ABOUTME: End-to-end tests running the scheduler over a real socket with the in-memory backend
// ABOUTME: Drives it through the worker client and checks graceful and fatal shutdown

use sandpool_cli::{EnvConfig, Scheduler, ServeArgs};
use sandpool_client::{AcquireOptions, ClientConfig, ClientError, SchedulerClient};
use sandpool_sandbox::{BackendKind, InMemoryProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn small_pool() -> ServeArgs {
    ServeArgs {
        baseline_size: 1,
        max_size: 2,
        wait_timeout_secs: 1,
        request_timeout_secs: 10,
        ..ServeArgs::default()
    }
}

fn memory_env() -> EnvConfig {
    EnvConfig {
        backend: BackendKind::Memory,
        session_root: Some("/mnt/sessions".to_string()),
        ..EnvConfig::default()
    }
}

fn client_for(listener: &TcpListener) -> SchedulerClient {
    let addr = listener.local_addr().unwrap();
    SchedulerClient::new(ClientConfig {
        max_retries: 1,
        request_timeout: Duration::from_secs(15),
        ..ClientConfig::new(format!("http://{}", addr))
    })
    .unwrap()
}

#[tokio::test]
async fn test_serve_acquire_release_and_drain() {
    let provider = Arc::new(InMemoryProvider::new());
    let scheduler = Scheduler::start(provider.clone(), &small_pool(), &memory_env())
        .await
        .unwrap();
    let pool = scheduler.pool.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(&listener);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(scheduler.serve(listener, async {
        let _ = stop_rx.await;
    }));

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.free, 1);
    assert_eq!(health.session_root.as_deref(), Some("/mnt/sessions"));

    let lease = client
        .acquire("worker-1", AcquireOptions::default())
        .await
        .unwrap();
    assert_eq!(lease.owner_id, "worker-1");
    assert_eq!(client.slots().await.unwrap().len(), 1);

    let err = client.release(&lease.slot_id, "worker-2").await.unwrap_err();
    assert_eq!(err.status(), Some(409));
    client.release(&lease.slot_id, "worker-1").await.unwrap();

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();

    assert!(!pool.is_accepting());
    assert_eq!(provider.active_count().await, 0);
}

#[tokio::test]
async fn test_fatal_backend_failure_stops_service() {
    let provider = Arc::new(InMemoryProvider::new());
    let scheduler = Scheduler::start(provider.clone(), &small_pool(), &memory_env())
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(&listener);
    let server = tokio::spawn(scheduler.serve(listener, std::future::pending::<()>()));

    client
        .acquire("worker-1", AcquireOptions::default())
        .await
        .unwrap();

    // The second acquire needs a fresh sandbox from a host that has gone away
    provider.set_unavailable(true).await;
    let second = client.acquire("worker-2", AcquireOptions::default()).await;
    assert!(matches!(
        second,
        Err(ClientError::Api { .. }) | Err(ClientError::RetriesExhausted { .. })
    ));

    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server should stop after a fatal error")
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.to_string().contains("fatal"));
}

#[tokio::test]
async fn test_unavailable_backend_refuses_to_start() {
    let provider = Arc::new(InMemoryProvider::new());
    provider.set_unavailable(true).await;

    let result = Scheduler::start(provider, &small_pool(), &memory_env()).await;
    assert!(result.is_err());
}
