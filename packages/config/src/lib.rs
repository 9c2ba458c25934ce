// ABOUTME: Environment-backed configuration helpers shared by sandpool binaries
// ABOUTME: Typed lookups over the variable names defined in constants

use std::env;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

pub mod constants;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Non-empty, trimmed value of `name`
pub fn var(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Value of `name`, or `default` when unset or blank
pub fn var_or(name: &'static str, default: &str) -> String {
    var(name).unwrap_or_else(|| default.to_string())
}

/// Parse `name` into `T`. Unset or blank values yield `None`.
pub fn parse<T>(name: &'static str) -> Result<Option<T>, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| EnvError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        None => {
            debug!(name, "Environment variable not set");
            Ok(None)
        }
    }
}

/// Parse `name` into `T`, falling back to `default`
pub fn parse_or<T>(name: &'static str, default: T) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse(name)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::constants::*;
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_blank_value_is_unset() {
        env::set_var(SANDPOOL_DOCKER_IMAGE, "   ");
        assert_eq!(var(SANDPOOL_DOCKER_IMAGE), None);
        assert_eq!(var_or(SANDPOOL_DOCKER_IMAGE, "img:latest"), "img:latest");
        env::remove_var(SANDPOOL_DOCKER_IMAGE);
    }

    #[test]
    #[serial]
    fn test_parse_port() {
        env::set_var(SANDPOOL_CONTAINER_PORT, "7070");
        assert_eq!(parse::<u16>(SANDPOOL_CONTAINER_PORT), Ok(Some(7070)));

        env::set_var(SANDPOOL_CONTAINER_PORT, "seventy");
        let err = parse::<u16>(SANDPOOL_CONTAINER_PORT).unwrap_err();
        assert!(err.to_string().contains(SANDPOOL_CONTAINER_PORT));

        env::remove_var(SANDPOOL_CONTAINER_PORT);
        assert_eq!(parse_or::<u16>(SANDPOOL_CONTAINER_PORT, 6060), Ok(6060));
    }
}
