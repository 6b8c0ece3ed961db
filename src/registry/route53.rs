//! `route53` provider
//!
//! Drives Amazon Route 53 through the official `aws` command line tool, so
//! credentials, profiles and regions resolve exactly as they do for the CLI.
//! The `AWS_*` environment present at construction time is captured and
//! handed to every CLI invocation.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::env;
use crate::challenge::{challenge_fqdn, txt_value};
use crate::error::{Error, Result};
use crate::provider::{DnsProvider, Timeouts};

pub const NAME: &str = "route53";

pub const ENV_CLI_PATH: &str = "AWS_CLI_PATH";
pub const ENV_HOSTED_ZONE_ID: &str = "AWS_HOSTED_ZONE_ID";
pub const ENV_TTL: &str = "AWS_TTL";
pub const ENV_PROPAGATION_TIMEOUT: &str = "AWS_PROPAGATION_TIMEOUT";
pub const ENV_POLLING_INTERVAL: &str = "AWS_POLLING_INTERVAL";

const DEFAULT_TTL: u32 = 10;
const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostedZoneList {
    hosted_zones: Vec<HostedZone>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostedZone {
    id: String,
    name: String,
    #[serde(default)]
    config: Option<HostedZoneConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostedZoneConfig {
    #[serde(default)]
    private_zone: bool,
}

/// Route 53 provider backed by the aws CLI
#[derive(Debug, Clone)]
pub struct Route53Provider {
    cli: String,
    hosted_zone_id: Option<String>,
    ttl: u32,
    timeouts: Timeouts,
    aws_env: Vec<(String, String)>,
}

impl Route53Provider {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            cli: env::get_or_default_string(ENV_CLI_PATH, "aws"),
            hosted_zone_id: env::get(ENV_HOSTED_ZONE_ID),
            ttl: env::get_or_default_u32(ENV_TTL, DEFAULT_TTL),
            timeouts: Timeouts::new(
                env::get_or_default_secs(ENV_PROPAGATION_TIMEOUT, DEFAULT_PROPAGATION_TIMEOUT),
                env::get_or_default_secs(ENV_POLLING_INTERVAL, DEFAULT_POLLING_INTERVAL),
            ),
            aws_env: env::with_prefix("AWS_"),
        })
    }

    async fn aws(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!("route53: {} {:?}", self.cli, args);

        let output = Command::new(&self.cli)
            .args(args)
            .envs(self.aws_env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("route53: failed to start {}", self.cli))?;

        if !output.status.success() {
            return Err(Error::Provider(format!(
                "route53: {} failed ({}): {}",
                args.get(1).copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Hosted zone owning `fqdn`: configured, or the longest public zone suffix.
    async fn hosted_zone(&self, fqdn: &str) -> Result<String> {
        if let Some(id) = &self.hosted_zone_id {
            return Ok(id.clone());
        }

        let stdout = self
            .aws(&["route53", "list-hosted-zones-by-name", "--output", "json"])
            .await?;
        let list: HostedZoneList = serde_json::from_slice(&stdout)
            .context("route53: failed to parse list-hosted-zones-by-name output")?;

        find_zone(&list.hosted_zones, fqdn).ok_or_else(|| {
            Error::Provider(format!("route53: no hosted zone found for {}", fqdn))
        })
    }

    async fn change(&self, action: &str, domain: &str, key_auth: &str) -> Result<()> {
        let fqdn = challenge_fqdn(domain);
        let zone = self.hosted_zone(&fqdn).await?;
        let batch = change_batch(action, &fqdn, &txt_value(key_auth), self.ttl);

        self.aws(&[
            "route53",
            "change-resource-record-sets",
            "--hosted-zone-id",
            &zone,
            "--change-batch",
            &batch.to_string(),
        ])
        .await
        .map_err(|e| Error::Provider(format!("{} ({} {})", e, action, fqdn)))?;

        info!("route53: {} {} in zone {}", action, fqdn, zone);
        Ok(())
    }
}

fn find_zone(zones: &[HostedZone], fqdn: &str) -> Option<String> {
    let fqdn = fqdn.to_ascii_lowercase();
    zones
        .iter()
        .filter(|z| !z.config.as_ref().is_some_and(|c| c.private_zone))
        .filter(|z| {
            let name = z.name.to_ascii_lowercase();
            fqdn == name || fqdn.ends_with(&format!(".{}", name))
        })
        .max_by_key(|z| z.name.len())
        .map(|z| z.id.trim_start_matches("/hostedzone/").to_string())
}

fn change_batch(action: &str, fqdn: &str, value: &str, ttl: u32) -> serde_json::Value {
    serde_json::json!({
        "Comment": "Managed by dns-challenge",
        "Changes": [{
            "Action": action,
            "ResourceRecordSet": {
                "Name": fqdn,
                "Type": "TXT",
                "TTL": ttl,
                "ResourceRecords": [{ "Value": format!("\"{}\"", value) }],
            },
        }],
    })
}

#[async_trait]
impl DnsProvider for Route53Provider {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        self.change("UPSERT", domain, key_auth).await
    }

    async fn clean_up(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        self.change("DELETE", domain, key_auth).await
    }

    fn timeout(&self) -> Option<Timeouts> {
        Some(self.timeouts)
    }
}

pub(super) fn construct() -> Result<Box<dyn DnsProvider>> {
    Ok(Box::new(Route53Provider::from_env()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str, name: &str, private: bool) -> HostedZone {
        HostedZone {
            id: id.to_string(),
            name: name.to_string(),
            config: Some(HostedZoneConfig {
                private_zone: private,
            }),
        }
    }

    #[test]
    fn test_find_zone_prefers_longest_public_suffix() {
        let zones = vec![
            zone("/hostedzone/ZROOT", "example.com.", false),
            zone("/hostedzone/ZSUB", "sub.example.com.", false),
            zone("/hostedzone/ZPRIV", "deep.sub.example.com.", true),
            zone("/hostedzone/ZOTHER", "ample.com.", false),
        ];

        assert_eq!(
            find_zone(&zones, "_acme-challenge.deep.sub.example.com.").as_deref(),
            Some("ZSUB")
        );
        assert_eq!(
            find_zone(&zones, "_acme-challenge.example.com.").as_deref(),
            Some("ZROOT")
        );
        assert_eq!(find_zone(&zones, "_acme-challenge.example.org."), None);
    }

    #[test]
    fn test_change_batch_quotes_value() {
        let batch = change_batch("UPSERT", "_acme-challenge.example.com.", "abc", 10);
        let record = &batch["Changes"][0]["ResourceRecordSet"];
        assert_eq!(batch["Changes"][0]["Action"], "UPSERT");
        assert_eq!(record["Type"], "TXT");
        assert_eq!(record["ResourceRecords"][0]["Value"], "\"abc\"");
    }
}
