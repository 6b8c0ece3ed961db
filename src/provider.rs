//! Provider capability contract
//!
//! Everything the orchestrator drives implements [`DnsProvider`]: providers
//! constructed in-process by the registry as well as the proxies that forward
//! to an isolated worker process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;

/// Propagation timeout used when no provider declares one.
pub const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Polling interval used when no provider declares one.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);

/// Settling interval for providers that are sequential but declare no interval.
pub const DEFAULT_SEQUENCE_INTERVAL: Duration = Duration::from_secs(60);

/// One configured provider instance, as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Registry name of the provider (e.g. `route53`, `exec`)
    pub name: String,
    /// Settings exported into the provider's environment
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Resolvers the caller should use to check propagation
    #[serde(default)]
    pub recursive_nameservers: Vec<String>,
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_nameserver(mut self, nameserver: impl Into<String>) -> Self {
        self.recursive_nameservers.push(nameserver.into());
        self
    }
}

/// Propagation timeout and polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Timeouts {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Replace undeclared (zero) components with the library defaults.
    pub fn or_defaults(self) -> Self {
        Self {
            timeout: if self.timeout.is_zero() {
                DEFAULT_PROPAGATION_TIMEOUT
            } else {
                self.timeout
            },
            interval: if self.interval.is_zero() {
                DEFAULT_POLLING_INTERVAL
            } else {
                self.interval
            },
        }
    }

    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        Self {
            timeout: self.timeout.max(other.timeout),
            interval: self.interval.max(other.interval),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(DEFAULT_PROPAGATION_TIMEOUT, DEFAULT_POLLING_INTERVAL)
    }
}

/// Present/remove DNS-01 TXT records.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create the TXT record answering the challenge.
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// Remove the TXT record. Must be safe to call even if `present` failed.
    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// Declared propagation timeout and polling interval, if any.
    fn timeout(&self) -> Option<Timeouts> {
        None
    }

    /// `Some(interval)` if this provider must not overlap with others.
    fn sequential(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
impl<P: DnsProvider + ?Sized> DnsProvider for Box<P> {
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        (**self).present(domain, token, key_auth).await
    }

    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        (**self).clean_up(domain, token, key_auth).await
    }

    fn timeout(&self) -> Option<Timeouts> {
        (**self).timeout()
    }

    fn sequential(&self) -> Option<Duration> {
        (**self).sequential()
    }
}
