// ABOUTME: HTTP scheduling service for the sandbox pool
// ABOUTME: Builds the axum router with request tracing and a server-side request timeout

use axum::{
    routing::{get, post},
    Router,
};
use sandpool_sandbox::PoolManager;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

pub mod error;
pub mod extract;
pub mod handlers;
pub mod response;

pub use error::{ApiResult, AppError};
pub use extract::ValidJson;
pub use response::ApiResponse;

/// Default server-side request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared state for the scheduling handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
    /// Queued acquires are clamped below this
    pub request_timeout: Duration,
    /// Artifact root advertised to rollout workers
    pub session_root: Option<String>,
}

impl AppState {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self {
            pool,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            session_root: None,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_session_root(mut self, session_root: Option<String>) -> Self {
        self.session_root = session_root;
        self
    }
}

/// Creates the scheduling API router
pub fn create_router(state: AppState) -> Router {
    let request_timeout = state.request_timeout;

    Router::new()
        .route("/api/acquire", post(handlers::acquire))
        .route("/api/release", post(handlers::release))
        .route("/api/health", get(handlers::health))
        .route("/api/slots", get(handlers::list_slots))
        .route("/api/scale", post(handlers::scale))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout)),
        )
}
