//! Challenge orchestrator
//!
//! Presents one [`DnsProvider`] over any number of configured providers.
//!
//! - Parallel: every provider is invoked concurrently, no waits.
//! - Sequential (any member is sequential): providers run one at a time in
//!   configuration order with a settling pause between them. The pause is
//!   the largest interval any member declared.
//!
//! Every provider is attempted on every call. Failures are collected and
//! returned together once all providers have been tried.

use async_trait::async_trait;
use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AggregateError, Error, Result};
use crate::plugin::{Closer, ProcessOptions, ProviderProcess};
use crate::provider::{DnsProvider, ProviderSpec, Timeouts};
use crate::registry::Registry;

/// Execution discipline derived from the configured providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Parallel,
    /// One at a time, pausing for the interval between providers
    Sequential(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Present,
    CleanUp,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::CleanUp => "cleanup",
        }
    }
}

/// Aggregate provider over an ordered provider set
pub struct ChallengeProvider {
    providers: Vec<Box<dyn DnsProvider>>,
    discipline: Discipline,
    timeouts: Timeouts,
    recursive_nameservers: Vec<String>,
}

impl std::fmt::Debug for ChallengeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeProvider")
            .field("providers", &self.providers.len())
            .field("discipline", &self.discipline)
            .field("timeouts", &self.timeouts)
            .field("recursive_nameservers", &self.recursive_nameservers)
            .finish()
    }
}

impl ChallengeProvider {
    /// Compose `providers`; their order is the execution order.
    pub fn new(providers: Vec<Box<dyn DnsProvider>>) -> Self {
        let discipline = discipline_of(&providers);
        let timeouts = aggregate_timeouts(&providers);

        debug!(
            "Challenge provider over {} provider(s): {:?}, {:?}",
            providers.len(),
            discipline,
            timeouts
        );

        Self {
            providers,
            discipline,
            timeouts,
            recursive_nameservers: Vec::new(),
        }
    }

    /// Record resolvers for the caller's propagation check, de-duplicated.
    pub fn with_recursive_nameservers<I, S>(mut self, nameservers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for ns in nameservers {
            let ns = ns.into();
            if !self.recursive_nameservers.contains(&ns) {
                self.recursive_nameservers.push(ns);
            }
        }
        self
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Settling interval, when sequential.
    pub fn sequence_interval(&self) -> Option<Duration> {
        match self.discipline {
            Discipline::Parallel => None,
            Discipline::Sequential(interval) => Some(interval),
        }
    }

    /// Aggregate propagation timeout and polling interval.
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn recursive_nameservers(&self) -> &[String] {
        &self.recursive_nameservers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    async fn run(&self, op: Operation, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        let mut errors = AggregateError::new();

        match self.discipline {
            Discipline::Parallel => {
                let calls = self
                    .providers
                    .iter()
                    .map(|p| invoke(p.as_ref(), op, domain, token, key_auth));
                for (index, result) in join_all(calls).await.into_iter().enumerate() {
                    if let Err(e) = result {
                        warn!("Provider #{} {} failed for {}: {}", index, op.as_str(), domain, e);
                        errors.push(e);
                    }
                }
            }
            Discipline::Sequential(interval) => {
                let last = self.providers.len().saturating_sub(1);
                for (index, provider) in self.providers.iter().enumerate() {
                    if let Err(e) = invoke(provider.as_ref(), op, domain, token, key_auth).await {
                        warn!("Provider #{} {} failed for {}: {}", index, op.as_str(), domain, e);
                        errors.push(e);
                    }
                    // Wait even after a failure: an earlier change may still be settling.
                    if index < last {
                        debug!(
                            "Waiting {}s before the next provider",
                            interval.as_secs_f64()
                        );
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }

        if errors.is_empty() {
            info!(
                "{} succeeded for {} on {} provider(s)",
                op.as_str(),
                domain,
                self.providers.len()
            );
        }
        errors.into_result()
    }
}

async fn invoke(
    provider: &dyn DnsProvider,
    op: Operation,
    domain: &str,
    token: &str,
    key_auth: &str,
) -> Result<()> {
    match op {
        Operation::Present => provider.present(domain, token, key_auth).await,
        Operation::CleanUp => provider.clean_up(domain, token, key_auth).await,
    }
}

fn discipline_of(providers: &[Box<dyn DnsProvider>]) -> Discipline {
    providers
        .iter()
        .filter_map(|p| p.sequential())
        .max()
        .map_or(Discipline::Parallel, Discipline::Sequential)
}

fn aggregate_timeouts(providers: &[Box<dyn DnsProvider>]) -> Timeouts {
    providers
        .iter()
        .map(|p| p.timeout().unwrap_or_default().or_defaults())
        .fold(Timeouts::default(), Timeouts::max)
}

#[async_trait]
impl DnsProvider for ChallengeProvider {
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.run(Operation::Present, domain, token, key_auth).await
    }

    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.run(Operation::CleanUp, domain, token, key_auth).await
    }

    fn timeout(&self) -> Option<Timeouts> {
        Some(self.timeouts)
    }

    fn sequential(&self) -> Option<Duration> {
        self.sequence_interval()
    }
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

/// Where provider instances live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// One worker process per spec
    #[default]
    Process,
    /// In this process, environment applied under a global lock
    InProcess,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub isolation: Isolation,
    pub process: ProcessOptions,
    /// Used for in-process construction
    pub registry: Registry,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            process: ProcessOptions::default(),
            registry: Registry::builtin(),
        }
    }
}

/// Build the aggregate provider for `specs`.
///
/// Every returned [`Closer`] must be invoked once the challenge flow is
/// over, whatever its outcome. On error nothing is returned and every worker
/// started so far has already been closed.
pub async fn build(
    specs: &[ProviderSpec],
    options: &BuildOptions,
) -> Result<(ChallengeProvider, Vec<Closer>)> {
    if specs.is_empty() {
        return Err(Error::configuration(
            "dns-challenge",
            "at least one DNS provider must be configured",
        ));
    }

    let (providers, closers) = match options.isolation {
        Isolation::Process => build_processes(specs, &options.process).await?,
        Isolation::InProcess => {
            let providers = specs
                .iter()
                .map(|spec| options.registry.construct_in_process(spec))
                .collect::<Result<Vec<_>>>()?;
            (providers, Vec::new())
        }
    };

    let challenge = ChallengeProvider::new(providers).with_recursive_nameservers(
        specs
            .iter()
            .flat_map(|s| s.recursive_nameservers.iter().cloned()),
    );

    info!(
        "Built challenge provider from {} spec(s): {:?}",
        specs.len(),
        challenge.discipline()
    );
    Ok((challenge, closers))
}

async fn build_processes(
    specs: &[ProviderSpec],
    options: &ProcessOptions,
) -> Result<(Vec<Box<dyn DnsProvider>>, Vec<Closer>)> {
    let launches = specs
        .iter()
        .map(|spec| ProviderProcess::launch(spec, options.clone()));
    let results = join_all(launches).await;

    let mut providers: Vec<Box<dyn DnsProvider>> = Vec::with_capacity(specs.len());
    let mut closers = Vec::with_capacity(specs.len());
    let mut first_error = None;

    for result in results {
        match result {
            Ok(process) => {
                closers.push(process.closer());
                providers.push(Box::new(process));
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(err) = first_error {
        for closer in &closers {
            let _ = closer.close().await;
        }
        return Err(err);
    }
    Ok((providers, closers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DEFAULT_POLLING_INTERVAL, DEFAULT_PROPAGATION_TIMEOUT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Stub {
        fail: Option<&'static str>,
        timeouts: Option<Timeouts>,
        sequential: Option<Duration>,
        presents: Arc<AtomicUsize>,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DnsProvider for Stub {
        async fn present(&self, _: &str, _: &str, _: &str) -> Result<()> {
            self.presents.fetch_add(1, Ordering::SeqCst);
            self.fail.map_or(Ok(()), |m| Err(Error::Provider(m.to_string())))
        }

        async fn clean_up(&self, _: &str, _: &str, _: &str) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            self.fail.map_or(Ok(()), |m| Err(Error::Provider(m.to_string())))
        }

        fn timeout(&self) -> Option<Timeouts> {
            self.timeouts
        }

        fn sequential(&self) -> Option<Duration> {
            self.sequential
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_single_parallel_provider() {
        let p = ChallengeProvider::new(vec![Box::new(Stub::default())]);
        assert_eq!(p.discipline(), Discipline::Parallel);
        assert_eq!(p.sequence_interval(), None);
    }

    #[test]
    fn test_one_sequential_member_makes_all_sequential() {
        let p = ChallengeProvider::new(vec![
            Box::new(Stub::default()),
            Box::new(Stub {
                sequential: Some(secs(60)),
                ..Default::default()
            }),
        ]);
        assert_eq!(p.discipline(), Discipline::Sequential(secs(60)));
    }

    #[test]
    fn test_sequence_interval_is_the_maximum() {
        let p = ChallengeProvider::new(vec![
            Box::new(Stub {
                sequential: Some(secs(60)),
                ..Default::default()
            }),
            Box::new(Stub {
                sequential: Some(secs(123)),
                ..Default::default()
            }),
            Box::new(Stub {
                sequential: Some(secs(5)),
                ..Default::default()
            }),
        ]);
        assert_eq!(p.discipline(), Discipline::Sequential(secs(123)));
    }

    #[test]
    fn test_timeout_aggregation_uses_default_floor() {
        let p = ChallengeProvider::new(vec![
            Box::new(Stub {
                timeouts: Some(Timeouts::new(secs(30), secs(5))),
                ..Default::default()
            }),
            Box::new(Stub {
                timeouts: Some(Timeouts::new(Duration::ZERO, Duration::ZERO)),
                ..Default::default()
            }),
        ]);
        assert_eq!(
            p.timeouts(),
            Timeouts::new(
                secs(30).max(DEFAULT_PROPAGATION_TIMEOUT),
                secs(5).max(DEFAULT_POLLING_INTERVAL)
            )
        );
        assert_eq!(p.timeout(), Some(p.timeouts()));
    }

    #[test]
    fn test_nameservers_are_deduplicated_in_order() {
        let p = ChallengeProvider::new(vec![Box::new(Stub::default())])
            .with_recursive_nameservers(["1.1.1.1:53", "8.8.8.8:53", "1.1.1.1:53"]);
        assert_eq!(p.recursive_nameservers(), ["1.1.1.1:53", "8.8.8.8:53"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_provider_invoked_once_per_call() {
        let presents: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let cleanups: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let p = ChallengeProvider::new(
            presents
                .iter()
                .zip(&cleanups)
                .map(|(pc, cc)| {
                    Box::new(Stub {
                        sequential: Some(secs(1)),
                        presents: pc.clone(),
                        cleanups: cc.clone(),
                        ..Default::default()
                    }) as Box<dyn DnsProvider>
                })
                .collect(),
        );

        p.present("example.com", "t", "k").await.unwrap();
        p.clean_up("example.com", "t", "k").await.unwrap();
        for c in presents.iter().chain(&cleanups) {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_parallel_attempts_all_after_failure() {
        let counters: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let p = ChallengeProvider::new(
            counters
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    Box::new(Stub {
                        fail: (i == 0).then_some("first provider exploded"),
                        presents: c.clone(),
                        ..Default::default()
                    }) as Box<dyn DnsProvider>
                })
                .collect(),
        );

        let err = p.present("example.com", "t", "k").await.unwrap_err();
        assert!(err.to_string().contains("first provider exploded"));
        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_waits_between_providers_even_on_failure() {
        let p = ChallengeProvider::new(vec![
            Box::new(Stub {
                fail: Some("boom"),
                sequential: Some(secs(10)),
                ..Default::default()
            }),
            Box::new(Stub::default()),
            Box::new(Stub::default()),
        ]);

        let start = tokio::time::Instant::now();
        let err = p.clean_up("example.com", "t", "k").await.unwrap_err();
        let elapsed = start.elapsed();
        assert!(elapsed >= secs(20) && elapsed < secs(21), "{:?}", elapsed);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_build_rejects_empty_spec_list() {
        let err = build(&[], &BuildOptions::default()).await.unwrap_err();
        assert!(err.is_configuration());
    }
}
