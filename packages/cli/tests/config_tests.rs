// ABOUTME: Tests for command-line and environment configuration of the scheduler
// ABOUTME: Uses serial execution because the environment is process-global

use clap::Parser;
use pretty_assertions::assert_eq;
use rstest::rstest;
use sandpool_cli::{ConfigError, EnvConfig, ServeArgs};
use sandpool_config::constants::*;
use sandpool_sandbox::{BackendKind, RecyclePolicy};
use serial_test::serial;
use std::env;
use std::time::Duration;

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    serve: ServeArgs,
}

fn parse(args: &[&str]) -> ServeArgs {
    let mut argv = vec!["sandpool"];
    argv.extend_from_slice(args);
    TestCli::try_parse_from(argv).unwrap().serve
}

fn clear_env() {
    for name in [
        SANDPOOL_BACKEND,
        SANDPOOL_SESSION_ROOT,
        SANDPOOL_DOCKER_IMAGE,
        SANDPOOL_CONTAINER_PORT,
        SANDPOOL_ADVERTISE_HOST,
        SANDPOOL_REMOTE_API_URL,
        SANDPOOL_REMOTE_API_TOKEN,
        SANDPOOL_PROBE_PATH,
        SANDPOOL_PROBE_DEVICE,
    ] {
        env::remove_var(name);
    }
}

#[test]
fn test_serve_defaults() {
    let args = parse(&[]);
    assert_eq!(args.baseline_size, 64);
    assert_eq!(args.max_size, 96);
    assert_eq!(args.cpu_millicores, 6000);
    assert_eq!(args.memory_mb, 12000);
    assert_eq!(args.host, "0.0.0.0");
    assert_eq!(args.port, 8080);
    assert_eq!(args.readiness_timeout_secs, 900);
    assert_eq!(args.recycle, RecyclePolicy::Reuse);
    assert_eq!(args.idle_timeout_secs, None);

    let defaults = ServeArgs::default();
    assert_eq!(args.max_lease_secs, defaults.max_lease_secs);
    assert_eq!(args.request_timeout_secs, defaults.request_timeout_secs);
}

#[test]
fn test_flags_map_to_pool_settings() {
    let args = parse(&[
        "--baseline-size",
        "2",
        "--max-size",
        "4",
        "--memory-mb",
        "2048",
        "--lease-secs",
        "120",
        "--idle-timeout-secs",
        "30",
        "--recycle",
        "replace",
    ]);
    let settings = args.pool_settings().unwrap();

    assert_eq!(settings.baseline_size, 2);
    assert_eq!(settings.max_size, 4);
    assert_eq!(settings.resource_spec.memory_mb(), 2048);
    assert_eq!(settings.default_lease, Duration::from_secs(120));
    assert_eq!(settings.idle_timeout, Some(Duration::from_secs(30)));
    assert_eq!(settings.recycle, RecyclePolicy::Replace);
}

#[rstest]
#[case(&["--baseline-size", "10", "--max-size", "4"])]
#[case(&["--max-size", "0", "--baseline-size", "0"])]
#[case(&["--lease-secs", "0"])]
#[case(&["--lease-secs", "100", "--max-lease-secs", "50"])]
#[case(&["--port", "0"])]
#[case(&["--request-timeout-secs", "0"])]
#[case(&["--max-lease-secs", "18446744073709551615"])]
fn test_invalid_flags_rejected(#[case] flags: &[&str]) {
    assert!(parse(flags).pool_settings().is_err());
}

#[test]
fn test_unknown_recycle_policy_fails_to_parse() {
    assert!(TestCli::try_parse_from(["sandpool", "--recycle", "shred"]).is_err());
}

#[test]
#[serial]
fn test_env_defaults() {
    clear_env();
    let config = EnvConfig::from_env().unwrap();

    assert_eq!(config.backend, BackendKind::Docker);
    assert_eq!(config.container_port, 6060);
    assert_eq!(config.session_root, None);
    assert_eq!(config.probe_config().path, "/start");
}

#[rstest]
#[case("memory", BackendKind::Memory)]
#[case("simple", BackendKind::Docker)]
#[case("docker", BackendKind::Docker)]
#[case("advanced", BackendKind::Remote)]
#[serial]
fn test_backend_aliases(#[case] value: &str, #[case] expected: BackendKind) {
    clear_env();
    env::set_var(SANDPOOL_BACKEND, value);
    env::set_var(SANDPOOL_REMOTE_API_URL, "http://envs.internal");

    assert_eq!(EnvConfig::from_env().unwrap().backend, expected);
    clear_env();
}

#[test]
#[serial]
fn test_unknown_backend_rejected() {
    clear_env();
    env::set_var(SANDPOOL_BACKEND, "kubernetes");

    assert!(matches!(
        EnvConfig::from_env(),
        Err(ConfigError::InvalidBackend(_))
    ));
    clear_env();
}

#[test]
#[serial]
fn test_remote_backend_requires_url() {
    clear_env();
    env::set_var(SANDPOOL_BACKEND, "remote");

    assert!(matches!(
        EnvConfig::from_env(),
        Err(ConfigError::Missing(SANDPOOL_REMOTE_API_URL, _))
    ));
    clear_env();
}

#[test]
#[serial]
fn test_docker_overrides_from_env() {
    clear_env();
    env::set_var(SANDPOOL_DOCKER_IMAGE, "registry.local/android-env:2");
    env::set_var(SANDPOOL_CONTAINER_PORT, "7000");
    env::set_var(SANDPOOL_ADVERTISE_HOST, "10.1.2.3");
    env::set_var(SANDPOOL_PROBE_PATH, "/ready");
    env::set_var(SANDPOOL_PROBE_DEVICE, "Pixel_8_API_34");
    env::set_var(SANDPOOL_SESSION_ROOT, "/mnt/sessions");

    let config = EnvConfig::from_env().unwrap();
    let docker = config.docker_config(Duration::from_secs(120));

    assert_eq!(docker.image, "registry.local/android-env:2");
    assert_eq!(docker.container_port, 7000);
    assert_eq!(docker.advertise_host, "10.1.2.3");
    assert_eq!(docker.readiness_timeout, Duration::from_secs(120));
    assert_eq!(docker.probe.path, "/ready");
    assert_eq!(
        docker.probe.body,
        Some(serde_json::json!({"avd_name": "Pixel_8_API_34"}))
    );
    assert_eq!(config.session_root.as_deref(), Some("/mnt/sessions"));
    clear_env();
}

#[test]
#[serial]
fn test_invalid_container_port_rejected() {
    clear_env();
    env::set_var(SANDPOOL_CONTAINER_PORT, "not-a-port");
    assert!(matches!(EnvConfig::from_env(), Err(ConfigError::Env(_))));

    env::set_var(SANDPOOL_CONTAINER_PORT, "0");
    assert!(matches!(
        EnvConfig::from_env(),
        Err(ConfigError::PortOutOfRange(0))
    ));
    clear_env();
}
