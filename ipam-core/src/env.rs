//! helpers for reading settings that only live in the environment
//! (everything with a cli flag goes through [`clap`] instead)
use anyhow::Context;

use std::{env, str, time::Duration};

/// Read `name` from the environment, falling back to `default`, and parse it
/// into `T`. The error message carries the variable name.
/// # Examples
/// ```
/// let frmt: String = ipam_core::env::parse_var_with_err("IPAM_DOC_UNSET", "standard").unwrap();
/// assert_eq!(frmt, "standard");
/// ```
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .with_context(|| format!("error parsing env var {name}"))
}

/// Read a number of seconds from `name`, or `None` if unset or unparseable
pub fn parse_secs_opt(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_parsed() {
        let val: u64 = parse_var_with_err("IPAM_TEST_DEFINITELY_UNSET", 42).unwrap();
        assert_eq!(val, 42);
        assert!(parse_secs_opt("IPAM_TEST_DEFINITELY_UNSET").is_none());
    }

    #[test]
    fn bad_default_names_the_var() {
        let err = parse_var_with_err::<u64, _>("IPAM_TEST_DEFINITELY_UNSET", "nope").unwrap_err();
        assert!(err.to_string().contains("IPAM_TEST_DEFINITELY_UNSET"));
    }
}
