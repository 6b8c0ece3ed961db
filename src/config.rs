//! Challenge Configuration
//!
//! On-disk description of the provider set used by the CLI:
//! - Ordered `[[provider]]` tables (name, config map, nameservers)
//! - Worker process settings

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::{BuildOptions, Isolation};
use crate::plugin::ProcessOptions;
use crate::provider::ProviderSpec;
use crate::registry::Registry;

/// Complete challenge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Providers, in execution order
    #[serde(default, rename = "provider")]
    pub providers: Vec<ProviderSpec>,
    /// Worker process settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds allowed for one provider call
    pub call_timeout_secs: u64,
    /// Seconds allowed for the worker handshake
    pub handshake_timeout_secs: u64,
    /// Construct providers in this process instead of workers
    pub in_process: bool,
    /// Worker executable override
    pub executable: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let process = ProcessOptions::default();
        Self {
            call_timeout_secs: process.call_timeout.as_secs(),
            handshake_timeout_secs: process.handshake_timeout.as_secs(),
            in_process: false,
            executable: None,
        }
    }
}

impl ChallengeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            bail!("At least one [[provider]] must be configured");
        }
        for (index, spec) in self.providers.iter().enumerate() {
            if spec.name.trim().is_empty() {
                bail!("Provider #{} has no name", index);
            }
            Registry::validate_config(&spec.name, &spec.config)?;
        }
        if self.worker.call_timeout_secs == 0 || self.worker.handshake_timeout_secs == 0 {
            bail!("Worker timeouts must be positive");
        }
        Ok(())
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            isolation: if self.worker.in_process {
                Isolation::InProcess
            } else {
                Isolation::Process
            },
            process: ProcessOptions {
                executable: self.worker.executable.clone(),
                call_timeout: Duration::from_secs(self.worker.call_timeout_secs),
                handshake_timeout: Duration::from_secs(self.worker.handshake_timeout_secs),
            },
            registry: Registry::builtin(),
        }
    }
}
