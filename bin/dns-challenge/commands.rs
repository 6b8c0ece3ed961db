//! CLI commands
//!
//! Every command builds the provider set, runs, and closes every worker
//! whether or not the run succeeded.

use anyhow::Result;
use dns_challenge::{build, ChallengeConfig, Closer, Discipline, DnsProvider};
use tracing::warn;

use crate::style::*;

/// Challenge identifiers passed to present/cleanup
pub struct ChallengeArgs {
    pub domain: String,
    pub token: String,
    pub key_auth: String,
}

pub async fn inspect(config: &ChallengeConfig) -> Result<()> {
    let (provider, closers) = build(&config.providers, &config.build_options()).await?;
    close_all(&closers).await;

    print_header("DNS Challenge Providers");
    for (index, spec) in config.providers.iter().enumerate() {
        print_key_value(
            &format!("#{}", index),
            &format!("{} ({} setting(s))", spec.name, spec.config.len()),
        );
    }
    println!();

    let discipline = match provider.discipline() {
        Discipline::Parallel => "parallel".to_string(),
        Discipline::Sequential(interval) => {
            format!("sequential, {}s between providers", interval.as_secs())
        }
    };
    let timeouts = provider.timeouts();
    print_key_value("Discipline", &discipline);
    print_key_value(
        "Propagation timeout",
        &format!("{}s", timeouts.timeout.as_secs()),
    );
    print_key_value(
        "Polling interval",
        &format!("{}s", timeouts.interval.as_secs()),
    );
    if !provider.recursive_nameservers().is_empty() {
        print_key_value(
            "Recursive nameservers",
            &provider.recursive_nameservers().join(", "),
        );
    }
    Ok(())
}

pub async fn present(config: &ChallengeConfig, args: ChallengeArgs) -> Result<()> {
    let (provider, closers) = build(&config.providers, &config.build_options()).await?;
    let result = provider
        .present(&args.domain, &args.token, &args.key_auth)
        .await;
    close_all(&closers).await;
    result?;

    print_success(&format!(
        "Challenge record presented for {} via {} provider(s)",
        args.domain,
        provider.len()
    ));
    Ok(())
}

pub async fn cleanup(config: &ChallengeConfig, args: ChallengeArgs) -> Result<()> {
    let (provider, closers) = build(&config.providers, &config.build_options()).await?;
    let result = provider
        .clean_up(&args.domain, &args.token, &args.key_auth)
        .await;
    close_all(&closers).await;
    result?;

    print_success(&format!(
        "Challenge record removed for {} via {} provider(s)",
        args.domain,
        provider.len()
    ));
    Ok(())
}

async fn close_all(closers: &[Closer]) {
    for closer in closers {
        if let Err(e) = closer.close().await {
            warn!("Failed to close {} worker: {}", closer.name(), e);
            print_warning(&format!("Failed to close {} worker: {}", closer.name(), e));
        }
    }
}
