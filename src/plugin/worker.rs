//! Provider worker (subprocess side)
//!
//! Hosts exactly one provider. Configure exports the provider settings into
//! this process's environment, constructs the provider from the registry and
//! keeps it for the lifetime of the connection. Present/CleanUp are
//! forwarded unchanged; there are no retries here.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::protocol::{
    Call, Handshake, ProviderInfo, Reply, Request, Response, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    PROTOCOL_VERSION, SESSION_KEY, WORKER_ARG,
};
use crate::error::{Error, WireError};
use crate::provider::DnsProvider;
use crate::registry::Registry;

/// Provider name if `args` (including argv[0]) request worker mode.
pub fn worker_invocation(args: &[String]) -> Option<&str> {
    match args {
        [_, flag, provider, ..] if flag == WORKER_ARG => Some(provider.as_str()),
        _ => None,
    }
}

enum WorkerState {
    Unconfigured,
    Configured {
        name: String,
        provider: Box<dyn DnsProvider>,
    },
}

/// Run the worker to completion on a single-threaded runtime.
///
/// The environment is mutated during Configure, so nothing else may be
/// running on other threads.
pub fn run(registry: Registry, provider: &str) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build worker runtime")?;

    let span = info_span!("worker", provider = %provider);
    runtime.block_on(serve(registry, provider.to_string()).instrument(span))
}

async fn serve(registry: Registry, provider: String) -> Result<()> {
    if std::env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        bail!(
            "This executable was started in provider worker mode without the expected \
             handshake secret. Worker mode is reserved for the dns-challenge orchestrator."
        );
    }
    let session = std::env::var(SESSION_KEY).unwrap_or_default();

    let mut stdout = tokio::io::stdout();
    let handshake = Handshake {
        protocol_version: PROTOCOL_VERSION,
        cookie: MAGIC_COOKIE_VALUE.to_string(),
        session,
        provider: provider.clone(),
    };
    write_line(&mut stdout, &serde_json::to_string(&handshake)?).await?;
    debug!("Handshake sent");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = WorkerState::Unconfigured;

    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                error!("Dropping malformed request: {}", e);
                continue;
            }
        };

        debug!("Request {} ({})", request.id, request.call.method());
        let reply = handle(&registry, &mut state, request.call).await;
        let response = Response {
            id: request.id,
            reply,
        };
        write_line(&mut stdout, &serde_json::to_string(&response)?).await?;
    }

    info!("Parent closed the connection, exiting");
    Ok(())
}

async fn handle(registry: &Registry, state: &mut WorkerState, call: Call) -> Reply {
    match call {
        Call::Configure { provider, config } => match configure(registry, state, &provider, &config)
        {
            Ok(info) => Reply::Configured(info),
            Err(e) => {
                warn!("Configure failed: {}", e);
                Reply::Error(WireError::from(&e))
            }
        },
        Call::Present {
            domain,
            token,
            key_auth,
        } => {
            let WorkerState::Configured { name, provider } = state else {
                return not_configured();
            };
            info!("Presenting {} challenge for {}", name, domain);
            done(provider.present(&domain, &token, &key_auth).await)
        }
        Call::CleanUp {
            domain,
            token,
            key_auth,
        } => {
            let WorkerState::Configured { name, provider } = state else {
                return not_configured();
            };
            info!("Cleaning up {} challenge for {}", name, domain);
            done(provider.clean_up(&domain, &token, &key_auth).await)
        }
        Call::Getenv { key } => Reply::Value(std::env::var(&key).ok()),
    }
}

fn configure(
    registry: &Registry,
    state: &mut WorkerState,
    provider: &str,
    config: &BTreeMap<String, String>,
) -> Result<ProviderInfo, Error> {
    if let WorkerState::Configured { name, .. } = state {
        return Err(Error::configuration(
            provider,
            format!("worker already hosts a configured {} provider", name),
        ));
    }
    if !registry.contains(provider) {
        return Err(Error::UnknownProvider(provider.to_string()));
    }

    registry.export_config(provider, config)?;
    let instance = registry.construct(provider)?;
    let info = ProviderInfo::new(instance.timeout(), instance.sequential());

    info!(
        "Configured {} provider ({} setting(s), sequential: {:?})",
        provider,
        config.len(),
        info.sequential()
    );
    *state = WorkerState::Configured {
        name: provider.to_string(),
        provider: instance,
    };
    Ok(info)
}

fn done(result: crate::error::Result<()>) -> Reply {
    match result {
        Ok(()) => Reply::Done,
        Err(e) => {
            warn!("Provider call failed: {}", e);
            Reply::Error(WireError::from(&e))
        }
    }
}

fn not_configured() -> Reply {
    Reply::Error(WireError::from(&Error::NotConfigured("worker".to_string())))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
