//! convenience fns for parsing env vars
use anyhow::Context;

use std::{env, str};

/// Returns the value of the environment variable `name` parsed as `T`, or
/// `default` when the variable is not set.
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
}

/// Calls [`parse_var`] but names the variable in the error
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}
