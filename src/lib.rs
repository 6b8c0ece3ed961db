//! DNS-01 Challenge Orchestration
//!
//! Presents and removes ACME DNS-01 TXT records through an ordered set of
//! DNS providers, each hosted in its own worker process so that providers
//! configured through environment variables never see each other's settings.
//!
//! ## Module Structure
//!
//! - `provider`: the `DnsProvider` capability and provider specs
//! - `orchestrator`: aggregate provider (parallel/sequential) and `build`
//! - `plugin`: worker processes, their wire protocol and the worker loop
//! - `registry`: provider name to constructor lookup and built-in providers
//! - `challenge`: DNS-01 record helpers
//! - `config`: configuration file for the CLI
//! - `error`: error taxonomy
//!
//! ## Usage
//!
//! ```no_run
//! # async fn run() -> dns_challenge::Result<()> {
//! use dns_challenge::{build, BuildOptions, DnsProvider, ProviderSpec};
//!
//! let specs = vec![ProviderSpec::new("exec").with_config("EXEC_PATH", "/usr/local/bin/hook")];
//! let (provider, closers) = build(&specs, &BuildOptions::default()).await?;
//!
//! let result = provider.present("example.com", "token", "token.thumbprint").await;
//! // ... wait for propagation using provider.timeouts() ...
//! let _ = provider.clean_up("example.com", "token", "token.thumbprint").await;
//!
//! for closer in closers {
//!     closer.close().await?;
//! }
//! result
//! # }
//! ```

pub mod challenge;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plugin;
pub mod provider;
pub mod registry;

pub use config::{ChallengeConfig, WorkerConfig};
pub use error::{AggregateError, Error, Result};
pub use orchestrator::{build, BuildOptions, ChallengeProvider, Discipline, Isolation};
pub use plugin::{Closer, ProcessOptions, ProviderProcess};
pub use provider::{
    DnsProvider, ProviderSpec, Timeouts, DEFAULT_POLLING_INTERVAL, DEFAULT_PROPAGATION_TIMEOUT,
    DEFAULT_SEQUENCE_INTERVAL,
};
pub use registry::Registry;
