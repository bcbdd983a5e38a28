use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

pub use wire::{
    BackendMode, BindingDecl, CreateMode, DeclaredType, ElectionConfig, LeaderDecl, NatsConfig,
    NatsSecurityMode, SubscribeMode, WatchConfig,
};

/// validated kvbind declarations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindConfig {
    inner: wire::Config,
    path: Option<PathBuf>,
}

impl BindConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(contents)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let inner: wire::Config = match serde_json::from_str(s) {
            Ok(cfg) => cfg,
            Err(_) => serde_yaml::from_str(s).context("config is neither valid JSON nor YAML")?,
        };
        validate(&inner)?;
        debug!(?inner);

        Ok(Self { inner, path: None })
    }

    pub fn backend(&self) -> BackendMode {
        self.inner.backend
    }
    /// `Some` whenever the backend is nats, checked in `validate`
    pub fn nats(&self) -> Option<&NatsConfig> {
        self.inner.nats.as_ref()
    }
    pub fn election(&self) -> &ElectionConfig {
        &self.inner.election
    }
    pub fn watch(&self) -> &WatchConfig {
        &self.inner.watch
    }
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.inner.values
    }
    pub fn dependencies(&self) -> &BTreeMap<String, String> {
        &self.inner.dependencies
    }
    pub fn bindings(&self) -> &[BindingDecl] {
        &self.inner.bindings
    }
    pub fn leaders(&self) -> &[LeaderDecl] {
        &self.inner.leaders
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn validate(cfg: &wire::Config) -> Result<()> {
    if cfg.backend == BackendMode::Nats {
        let nats = cfg
            .nats
            .as_ref()
            .context("nats backend requires a `nats` section")?;
        if nats.servers.is_empty() {
            bail!("nats.servers must list at least one server");
        }
        if nats.values_bucket.trim().is_empty() || nats.election_bucket.trim().is_empty() {
            bail!("nats bucket names must not be empty");
        }
    }

    if cfg.election.renew_interval >= cfg.election.lease_ttl {
        bail!(
            "election.renew_interval ({:?}) must be shorter than election.lease_ttl ({:?})",
            cfg.election.renew_interval,
            cfg.election.lease_ttl
        );
    }
    if cfg.watch.base_delay > cfg.watch.max_delay {
        bail!("watch.base_delay must not exceed watch.max_delay");
    }

    let mut names = HashSet::new();
    let all_names = cfg
        .bindings
        .iter()
        .map(|b| (&b.name, &b.path))
        .chain(cfg.leaders.iter().map(|l| (&l.name, &l.path)));
    for (name, path) in all_names {
        if name.trim().is_empty() {
            bail!("binding on path {path} has an empty name");
        }
        if path.trim().is_empty() {
            bail!("binding {name} has an empty path");
        }
        if !names.insert(name) {
            bail!("binding name {name} is declared more than once");
        }
    }

    for decl in &cfg.bindings {
        if decl.create == CreateMode::Lookup && decl.ty != DeclaredType::String {
            bail!(
                "binding {} uses `lookup`, which resolves named dependencies and requires `type: string`",
                decl.name
            );
        }
    }
    Ok(())
}
