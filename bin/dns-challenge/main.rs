//! DNS Challenge CLI
//!
//! Presents and cleans up DNS-01 challenge records through the providers
//! listed in a configuration file. The same executable doubles as the
//! provider worker when started with the reserved worker argument.

mod commands;
mod style;

use clap::{Parser, Subcommand};
use dns_challenge::plugin::{worker, worker_invocation};
use dns_challenge::{ChallengeConfig, Registry};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use commands::ChallengeArgs;
use style::print_error;

#[derive(Parser, Debug)]
#[command(name = "dns-challenge")]
#[command(about = "Present and clean up ACME DNS-01 challenge records")]
#[command(version)]
struct Cli {
    /// Provider configuration file
    #[arg(
        short,
        long,
        default_value = "dns-challenge.toml",
        env = "DNS_CHALLENGE_CONFIG"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the execution discipline and timing derived from the config
    Inspect,
    /// Create the challenge TXT record with every provider
    Present(RecordArgs),
    /// Remove the challenge TXT record with every provider
    Cleanup(RecordArgs),
}

#[derive(clap::Args, Debug)]
struct RecordArgs {
    /// Domain being validated
    #[arg(long)]
    domain: String,

    /// Challenge token
    #[arg(long)]
    token: String,

    /// Key authorization for the token
    #[arg(long, env = "DNS_CHALLENGE_KEY_AUTH")]
    key_auth: String,
}

impl From<RecordArgs> for ChallengeArgs {
    fn from(args: RecordArgs) -> Self {
        Self {
            domain: args.domain,
            token: args.token,
            key_auth: args.key_auth,
        }
    }
}

fn init_logging() {
    // stderr only: in worker mode stdout carries the RPC channel.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dns_challenge=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if let Some(provider) = worker_invocation(&args) {
        init_logging();
        return match worker::run(Registry::builtin(), provider) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("dns-challenge worker ({}): {:#}", provider, e);
                ExitCode::FAILURE
            }
        };
    }

    let cli = Cli::parse();
    init_logging();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            print_error(&format!("Failed to start runtime: {}", e));
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ChallengeConfig::load(&cli.config)?;

    match cli.command {
        Command::Inspect => commands::inspect(&config).await,
        Command::Present(args) => commands::present(&config, args.into()).await,
        Command::Cleanup(args) => commands::cleanup(&config, args.into()).await,
    }
}
