//! On-disk format of the kvbind declarations file.
//!
//! Everything here is plain serde data; [`crate::BindConfig`] validates it
//! and converts durations into `std::time::Duration`.
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// default JetStream KV bucket holding bound values
pub const DEFAULT_VALUES_BUCKET: &str = "kvbind_values";
/// default JetStream KV bucket holding election keys
pub const DEFAULT_ELECTION_BUCKET: &str = "kvbind_elections";

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendMode,
    pub nats: Option<NatsConfig>,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    /// seed data for the `memory` backend, keyed by path
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    /// named objects `lookup` bindings resolve against
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub bindings: Vec<BindingDecl>,
    #[serde(default)]
    pub leaders: Vec<LeaderDecl>,
}

/// which coordination service backs the bindings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    #[default]
    Nats,
    Memory,
}

/// Authentication mode used when connecting to NATS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatsSecurityMode {
    #[default]
    None,
    UserPassword,
    Token,
    Nkey,
    Tls,
    CredsFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    #[serde(default = "default_values_bucket")]
    pub values_bucket: String,
    #[serde(default = "default_election_bucket")]
    pub election_bucket: String,
    #[serde(default)]
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_duration",
        serialize_with = "serialize_optional_duration"
    )]
    pub connect_timeout: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_duration",
        serialize_with = "serialize_optional_duration"
    )]
    pub request_timeout: Option<Duration>,
    #[serde(default = "default_connect_retry_max")]
    pub connect_retry_max: u32,
}

/// Timing of the lease-based leader election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ElectionConfig {
    #[serde(
        default = "default_lease_ttl",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub lease_ttl: Duration,
    #[serde(
        default = "default_renew_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub renew_interval: Duration,
    #[serde(
        default = "default_retry_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_delay: Duration,
}

/// Retry behaviour when re-arming a watch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct WatchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "default_base_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(
        default = "default_max_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
}

/// A declared value or invoker binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BindingDecl {
    pub path: String,
    /// label used in logs and in the `/bindings` report
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: DeclaredType,
    #[serde(default)]
    pub subscribe: SubscribeMode,
    #[serde(default)]
    pub create: CreateMode,
    #[serde(default = "default_initial")]
    pub initial: bool,
}

/// A declared leadership flag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeaderDecl {
    pub path: String,
    pub name: String,
}

/// Value types a declarations file can bind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredType {
    #[default]
    String,
    Integer,
    Unsigned,
    Float,
    Bool,
    Duration,
    /// only logs every value it is invoked with
    Callback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeMode {
    #[default]
    None,
    DataChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    None,
    #[default]
    Construct,
    Lookup,
}

pub fn default_values_bucket() -> String {
    DEFAULT_VALUES_BUCKET.to_owned()
}

pub fn default_election_bucket() -> String {
    DEFAULT_ELECTION_BUCKET.to_owned()
}

pub const fn default_connect_retry_max() -> u32 {
    5
}

pub const fn default_lease_ttl() -> Duration {
    Duration::from_secs(15)
}

pub const fn default_renew_interval() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

pub const fn default_max_retries() -> u32 {
    5
}

pub const fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

pub const fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

pub const fn default_initial() -> bool {
    true
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_ttl: default_lease_ttl(),
            renew_interval: default_renew_interval(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Parse a duration string with optional time units
/// Accepts: "3600", "3600s", "250ms", "60m", "24h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    String(String),
}

impl RawDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::String(s) => parse_duration(&s).map_err(E::custom),
        }
    }
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(de)?.into_duration()
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawDuration>::deserialize(de)?
        .map(RawDuration::into_duration)
        .transpose()
}

fn serialize_duration<S>(d: &Duration, ser: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    ser.serialize_str(&format!("{}ms", d.as_millis()))
}

fn serialize_optional_duration<S>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match d {
        Some(d) => serialize_duration(d, ser),
        None => ser.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static EXAMPLE: &str = include_str!("../../../../example.yaml");

    // test we can encode/decode example file
    #[test]
    fn test_example() {
        let cfg: crate::wire::Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.backend, BackendMode::Nats);
        assert!(!cfg.bindings.is_empty());
        // back to the yaml and again
        let s = serde_yaml::to_string(&cfg).unwrap();
        let again: crate::wire::Config = serde_yaml::from_str(&s).unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3600s").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_duration_invalid_unit() {
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_yaml::from_str(
            r#"
backend: memory
bindings:
  - path: /config/limit
    name: limit
"#,
        )
        .unwrap();
        assert_eq!(cfg.backend, BackendMode::Memory);
        assert_eq!(cfg.election, ElectionConfig::default());
        assert_eq!(cfg.watch, WatchConfig::default());
        let decl = &cfg.bindings[0];
        assert_eq!(decl.ty, DeclaredType::String);
        assert_eq!(decl.subscribe, SubscribeMode::None);
        assert_eq!(decl.create, CreateMode::Construct);
        assert!(decl.initial);
    }

    #[test]
    fn test_durations_in_sections() {
        let cfg: Config = serde_yaml::from_str(
            r#"
backend: memory
election:
  lease_ttl: 6s
  renew_interval: 2000ms
  retry_delay: 1
watch:
  max_retries: 2
  base_delay: 10ms
  max_delay: 1s
"#,
        )
        .unwrap();
        assert_eq!(cfg.election.lease_ttl, Duration::from_secs(6));
        assert_eq!(cfg.election.renew_interval, Duration::from_secs(2));
        assert_eq!(cfg.election.retry_delay, Duration::from_secs(1));
        assert_eq!(cfg.watch.max_retries, 2);
        assert_eq!(cfg.watch.base_delay, Duration::from_millis(10));
    }
}
