//! `exec` provider
//!
//! Delegates record management to an external program:
//! - default mode: `EXEC_PATH present|cleanup <fqdn> <txt-value>`
//! - `EXEC_MODE=RAW`: `EXEC_PATH present|cleanup <domain> <token> <key-auth>`
//!
//! The program shares infrastructure with whatever else the operator runs,
//! so this provider is always sequential.

use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::env;
use crate::challenge::{challenge_fqdn, txt_value};
use crate::error::{Error, Result};
use crate::provider::{
    DnsProvider, Timeouts, DEFAULT_POLLING_INTERVAL, DEFAULT_PROPAGATION_TIMEOUT,
    DEFAULT_SEQUENCE_INTERVAL,
};

pub const NAME: &str = "exec";

pub const ENV_PATH: &str = "EXEC_PATH";
pub const ENV_MODE: &str = "EXEC_MODE";
pub const ENV_PROPAGATION_TIMEOUT: &str = "EXEC_PROPAGATION_TIMEOUT";
pub const ENV_POLLING_INTERVAL: &str = "EXEC_POLLING_INTERVAL";
pub const ENV_SEQUENCE_INTERVAL: &str = "EXEC_SEQUENCE_INTERVAL";

/// How challenge data is passed to the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// FQDN and TXT value
    Default,
    /// Domain, token and key authorization, untouched
    Raw,
}

/// External program provider
#[derive(Debug, Clone)]
pub struct ExecProvider {
    program: PathBuf,
    mode: ExecMode,
    timeouts: Timeouts,
    sequence_interval: Duration,
}

impl ExecProvider {
    /// Build from the current environment.
    pub fn from_env() -> Result<Self> {
        let program = PathBuf::from(env::get_required(NAME, ENV_PATH)?);
        let mode = match env::get(ENV_MODE).as_deref() {
            None => ExecMode::Default,
            Some(m) if m.eq_ignore_ascii_case("raw") => ExecMode::Raw,
            Some(other) => {
                return Err(Error::configuration(
                    NAME,
                    format!("unsupported {} {:?}", ENV_MODE, other),
                ))
            }
        };

        Ok(Self {
            program,
            mode,
            timeouts: Timeouts::new(
                env::get_or_default_secs(ENV_PROPAGATION_TIMEOUT, DEFAULT_PROPAGATION_TIMEOUT),
                env::get_or_default_secs(ENV_POLLING_INTERVAL, DEFAULT_POLLING_INTERVAL),
            ),
            sequence_interval: env::get_or_default_secs(
                ENV_SEQUENCE_INTERVAL,
                DEFAULT_SEQUENCE_INTERVAL,
            ),
        })
    }

    fn args(&self, domain: &str, token: &str, key_auth: &str) -> Vec<String> {
        match self.mode {
            ExecMode::Default => vec![challenge_fqdn(domain), txt_value(key_auth)],
            ExecMode::Raw => vec![
                domain.to_string(),
                token.to_string(),
                key_auth.to_string(),
            ],
        }
    }

    async fn run(&self, action: &str, args: Vec<String>) -> Result<()> {
        debug!("exec: {:?} {} {:?}", self.program, action, args);

        // Output is captured: in a worker, our stdout is the RPC channel.
        let output = Command::new(&self.program)
            .arg(action)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("exec: failed to start {:?}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Provider(format!(
                "exec: {} {} for {} failed ({}): {}",
                self.program.display(),
                action,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                detail
            )));
        }

        info!("exec: {} {} succeeded", self.program.display(), action);
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for ExecProvider {
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.run("present", self.args(domain, token, key_auth)).await
    }

    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.run("cleanup", self.args(domain, token, key_auth)).await
    }

    fn timeout(&self) -> Option<Timeouts> {
        Some(self.timeouts)
    }

    fn sequential(&self) -> Option<Duration> {
        Some(self.sequence_interval)
    }
}

pub(super) fn construct() -> Result<Box<dyn DnsProvider>> {
    Ok(Box::new(ExecProvider::from_env()?))
}
