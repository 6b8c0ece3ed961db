//! Provider registry
//!
//! Maps provider names to zero-argument constructors. Constructors read
//! their settings from the process environment, which is why workers export
//! a spec's config into their own environment before calling one.
//!
//! Alias tables mirror generic variable names onto the names a provider
//! actually reads.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::provider::{DnsProvider, ProviderSpec};

pub mod env;
pub mod exec;
pub mod route53;

/// Builds a provider from the current environment.
pub type Constructor = fn() -> Result<Box<dyn DnsProvider>>;

/// `from` is copied to `to` when `to` is not already set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvAlias {
    pub from: &'static str,
    pub to: &'static str,
}

/// Serializes in-process construction; the environment is process-wide.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Clone, Default)]
pub struct Registry {
    constructors: BTreeMap<&'static str, Constructor>,
    aliases: HashMap<&'static str, Vec<EnvAlias>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("providers", &self.names())
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the providers shipped in this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(exec::NAME, exec::construct);
        registry.register(route53::NAME, route53::construct);

        registry.alias(exec::NAME, "EXEC_SCRIPT", exec::ENV_PATH);
        registry.alias(route53::NAME, "AWS_ZONE_ID", route53::ENV_HOSTED_ZONE_ID);
        registry.alias(route53::NAME, "AWS_DEFAULT_REGION", "AWS_REGION");
        registry
    }

    pub fn register(&mut self, name: &'static str, constructor: Constructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn alias(&mut self, provider: &'static str, from: &'static str, to: &'static str) {
        self.aliases
            .entry(provider)
            .or_default()
            .push(EnvAlias { from, to });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    pub fn aliases(&self, provider: &str) -> &[EnvAlias] {
        self.aliases.get(provider).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Construct `name` from the current environment.
    pub fn construct(&self, name: &str) -> Result<Box<dyn DnsProvider>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))?;
        constructor()
    }

    /// Reject settings the environment cannot hold.
    ///
    /// Keys must be non-empty and free of `=` and NUL; values free of NUL.
    pub fn validate_config(name: &str, config: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in config {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(Error::configuration(
                    name,
                    format!("invalid setting name {:?}", key),
                ));
            }
            if value.contains('\0') {
                return Err(Error::configuration(
                    name,
                    format!("value of {} contains a NUL byte", key),
                ));
            }
        }
        Ok(())
    }

    /// Export `config` into this process's environment, then apply the
    /// provider's alias table.
    ///
    /// Nothing is exported when any entry is invalid. Only workers and the
    /// locked in-process path may call this.
    pub fn export_config(&self, name: &str, config: &BTreeMap<String, String>) -> Result<()> {
        Self::validate_config(name, config)?;
        for (key, value) in config {
            std::env::set_var(key, value);
        }
        for alias in self.aliases(name) {
            if env::get(alias.to).is_none() {
                if let Some(value) = env::get(alias.from) {
                    debug!("{}: mirroring {} to {}", name, alias.from, alias.to);
                    std::env::set_var(alias.to, value);
                }
            }
        }
        Ok(())
    }

    /// Construct a provider inside this process.
    ///
    /// Weaker than a worker process: the environment is mutated under a
    /// global lock and restored afterwards, so construction is isolated but
    /// anything reading the environment concurrently outside the lock is not.
    pub fn construct_in_process(&self, spec: &ProviderSpec) -> Result<Box<dyn DnsProvider>> {
        if !self.contains(&spec.name) {
            return Err(Error::UnknownProvider(spec.name.clone()));
        }

        Self::validate_config(&spec.name, &spec.config)?;

        let _guard = ENV_LOCK.lock();

        let mut touched: Vec<&str> = spec.config.keys().map(String::as_str).collect();
        touched.extend(self.aliases(&spec.name).iter().map(|a| a.to));
        let saved: Vec<(String, Option<String>)> = touched
            .iter()
            .map(|k| (k.to_string(), std::env::var(k).ok()))
            .collect();

        let result = self
            .export_config(&spec.name, &spec.config)
            .and_then(|()| self.construct(&spec.name));

        for (key, previous) in saved {
            match previous {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }

        if result.is_ok() {
            info!("Constructed {} provider in-process", spec.name);
        }
        result
    }
}
