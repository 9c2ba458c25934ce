// ABOUTME: Library half of the sandpool binary
// ABOUTME: Configuration, tracing setup and scheduler wiring shared by the CLI and its tests

pub mod config;
pub mod server;
pub mod telemetry;

pub use config::{ConfigError, EnvConfig, ServeArgs};
pub use server::{build_controller, run, Scheduler};
