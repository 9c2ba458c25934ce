// ABOUTME: Tracing subscriber setup for the sandpool binary
// ABOUTME: Compact structured logs filtered through RUST_LOG

use tracing_subscriber::EnvFilter;

/// Filter used when RUST_LOG is unset
pub const DEFAULT_LOG_FILTER: &str = "sandpool=info,tower_http=info";

/// Install the global subscriber. Later calls are ignored.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
