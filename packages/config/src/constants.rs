// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names read by sandpool

// Backend Selection
pub const SANDPOOL_BACKEND: &str = "SANDPOOL_BACKEND";

// Rollout Workers
pub const SANDPOOL_SESSION_ROOT: &str = "SANDPOOL_SESSION_ROOT";

// Docker Backend
pub const SANDPOOL_DOCKER_IMAGE: &str = "SANDPOOL_DOCKER_IMAGE";
pub const SANDPOOL_CONTAINER_PORT: &str = "SANDPOOL_CONTAINER_PORT";
pub const SANDPOOL_ADVERTISE_HOST: &str = "SANDPOOL_ADVERTISE_HOST";

// Remote Environment Backend
pub const SANDPOOL_REMOTE_API_URL: &str = "SANDPOOL_REMOTE_API_URL";
pub const SANDPOOL_REMOTE_API_TOKEN: &str = "SANDPOOL_REMOTE_API_TOKEN";

// Readiness Probe
pub const SANDPOOL_PROBE_PATH: &str = "SANDPOOL_PROBE_PATH";
pub const SANDPOOL_PROBE_DEVICE: &str = "SANDPOOL_PROBE_DEVICE";

// Scheduler Client
pub const SANDPOOL_URL: &str = "SANDPOOL_URL";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
