//! Provider process (parent side)
//!
//! Spawns one worker per provider instance and exposes it as a
//! [`DnsProvider`]. Lifecycle: `Unconfigured -> Configured -> Closed`.
//!
//! Calls are multiplexed by request id through a writer task and a reader
//! task, so a call abandoned by its caller (timeout, dropped future) never
//! desynchronises the connection and the process can still be closed.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{
    Call, Handshake, ProviderInfo, Reply, Request, Response, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    PROTOCOL_VERSION, SESSION_KEY, WORKER_ARG,
};
use crate::error::{Error, ErrorKind, Result, WireError};
use crate::provider::{DnsProvider, ProviderSpec, Timeouts};

/// How long a worker gets to exit after its stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Worker process settings
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Worker executable; the current executable when unset
    pub executable: Option<PathBuf>,
    /// Upper bound on a single Configure/Present/CleanUp round-trip
    pub call_timeout: Duration,
    /// How long to wait for the worker's handshake line
    pub handshake_timeout: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            executable: None,
            call_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ProcessOptions {
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    fn executable(&self) -> Result<PathBuf> {
        match &self.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|e| {
                Error::Process(format!("cannot locate current executable: {}", e))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unconfigured,
    Configured(ProviderInfo),
    Closed,
}

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
}

struct Inner {
    name: String,
    pid: Option<u32>,
    options: ProcessOptions,
    state: Mutex<State>,
    next_id: AtomicU64,
    pending: Arc<Mutex<Pending>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle on one isolated provider worker
pub struct ProviderProcess {
    inner: Arc<Inner>,
}

/// Shuts a worker down; cheap to clone, safe to call repeatedly.
#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProviderProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderProcess")
            .field("name", &self.inner.name)
            .field("pid", &self.inner.pid)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("name", &self.inner.name)
            .field("pid", &self.inner.pid)
            .finish()
    }
}

impl ProviderProcess {
    /// Spawn a worker for `provider` and complete the handshake.
    ///
    /// The returned process is unconfigured.
    pub async fn spawn(provider: &str, options: ProcessOptions) -> Result<Self> {
        let executable = options.executable()?;
        let session = hex::encode(rand::random::<[u8; 16]>());

        let mut command = Command::new(&executable);
        command
            .arg(WORKER_ARG)
            .arg(provider)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(SESSION_KEY, &session)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Own process group, so hooks the worker starts can be killed with it.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            Error::Process(format!(
                "failed to start {} worker ({}): {}",
                provider,
                executable.display(),
                e
            ))
        })?;

        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill().await;
                return Err(Error::Process(format!(
                    "{} worker started without stdio pipes",
                    provider
                )));
            }
        };

        let mut lines = BufReader::new(stdout).lines();
        if let Err(e) = handshake(provider, &session, &mut lines, options.handshake_timeout).await
        {
            warn!("Rejecting {} worker (pid {:?}): {}", provider, pid, e);
            let _ = child.kill().await;
            return Err(e);
        }
        debug!("{} worker (pid {:?}) handshake complete", provider, pid);

        let pending = Arc::new(Mutex::new(Pending::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(write_loop(provider.to_string(), stdin, rx)),
            tokio::spawn(read_loop(provider.to_string(), lines, pending.clone())),
        ];

        Ok(Self {
            inner: Arc::new(Inner {
                name: provider.to_string(),
                pid,
                options,
                state: Mutex::new(State::Unconfigured),
                next_id: AtomicU64::new(1),
                pending,
                outbound: Mutex::new(Some(tx)),
                child: tokio::sync::Mutex::new(Some(child)),
                tasks: Mutex::new(tasks),
            }),
        })
    }

    /// Spawn and configure a worker for `spec`.
    ///
    /// On failure the worker has already been shut down.
    pub async fn launch(spec: &ProviderSpec, options: ProcessOptions) -> Result<Self> {
        let process = Self::spawn(&spec.name, options).await?;
        if let Err(e) = process.configure(&spec.config).await {
            let _ = process.close().await;
            return Err(e);
        }
        Ok(process)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn is_configured(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Configured(_))
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.state.lock() == State::Closed
    }

    pub fn closer(&self) -> Closer {
        Closer {
            inner: self.inner.clone(),
        }
    }

    /// Send Configure; the worker exports `config` into its own environment.
    pub async fn configure(&self, config: &BTreeMap<String, String>) -> Result<()> {
        match *self.inner.state.lock() {
            State::Closed => return Err(Error::Closed(self.inner.name.clone())),
            State::Configured(_) => {
                return Err(Error::configuration(
                    &self.inner.name,
                    "provider process is already configured",
                ))
            }
            State::Unconfigured => {}
        }

        let reply = self
            .inner
            .call(Call::Configure {
                provider: self.inner.name.clone(),
                config: config.clone(),
            })
            .await?;

        match reply {
            Reply::Configured(info) => {
                let mut state = self.inner.state.lock();
                if *state == State::Closed {
                    return Err(Error::Closed(self.inner.name.clone()));
                }
                *state = State::Configured(info);
                info!(
                    "{} provider configured in worker (pid {:?})",
                    self.inner.name, self.inner.pid
                );
                Ok(())
            }
            Reply::Error(e) => Err(e.into_error(&self.inner.name)),
            other => Err(self.inner.unexpected("configure", &other)),
        }
    }

    /// Read a variable from the worker's environment.
    #[doc(hidden)]
    pub async fn getenv(&self, key: &str) -> Result<Option<String>> {
        if self.is_closed() {
            return Err(Error::Closed(self.inner.name.clone()));
        }
        match self
            .inner
            .call(Call::Getenv {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Value(value) => Ok(value),
            Reply::Error(e) => Err(e.into_error(&self.inner.name)),
            other => Err(self.inner.unexpected("getenv", &other)),
        }
    }

    /// Terminate the worker. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn configured_info(&self) -> Result<ProviderInfo> {
        match *self.inner.state.lock() {
            State::Configured(info) => Ok(info),
            State::Unconfigured => Err(Error::NotConfigured(self.inner.name.clone())),
            State::Closed => Err(Error::Closed(self.inner.name.clone())),
        }
    }

    async fn forward(&self, call: Call) -> Result<()> {
        self.configured_info()?;
        let method = call.method();
        match self.inner.call(call).await? {
            Reply::Done => Ok(()),
            Reply::Error(e) => Err(e.into_error(&self.inner.name)),
            other => Err(self.inner.unexpected(method, &other)),
        }
    }
}

impl Closer {
    /// Terminate the worker. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Inner {
    async fn call(&self, call: Call) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(self.exited());
            }
            pending.waiters.insert(id, tx);
        }

        let line = serde_json::to_string(&Request { id, call })
            .map_err(|e| Error::Process(format!("failed to encode request: {}", e)))?;

        let sent = match &*self.outbound.lock() {
            Some(sender) => sender.send(line).map_err(|_| self.exited()),
            None => Err(Error::Closed(self.name.clone())),
        };
        if let Err(e) = sent {
            self.pending.lock().waiters.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.options.call_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.exited()),
            Err(_) => {
                self.pending.lock().waiters.remove(&id);
                warn!(
                    "{} worker did not answer request {} within {}s",
                    self.name,
                    id,
                    self.options.call_timeout.as_secs()
                );
                Err(Error::Timeout(self.options.call_timeout))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == State::Closed {
                return Ok(());
            }
            *state = State::Closed;
        }

        // Dropping the sender ends the writer task, which closes the
        // worker's stdin; the worker exits on EOF.
        self.outbound.lock().take();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("{} worker exited: {}", self.name, status),
                Ok(Err(e)) => warn!("Failed to wait for {} worker: {}", self.name, e),
                Err(_) => {
                    warn!(
                        "{} worker (pid {:?}) did not exit, killing it",
                        self.name, self.pid
                    );
                    // The worker is not reaped yet, so its group id is still ours.
                    kill_process_group(&self.name, self.pid);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {} worker: {}", self.name, e);
                    }
                }
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut pending = self.pending.lock();
        pending.closed = true;
        pending.waiters.clear();

        info!("{} worker closed", self.name);
        Ok(())
    }

    fn exited(&self) -> Error {
        Error::Process(format!(
            "{} worker (pid {:?}) exited or closed its connection",
            self.name, self.pid
        ))
    }

    fn unexpected(&self, method: &str, reply: &Reply) -> Error {
        Error::Process(format!(
            "{} worker sent an unexpected reply to {}: {:?}",
            self.name, method, reply
        ))
    }
}

/// SIGKILL the worker's process group, including any hook still running.
#[cfg(unix)]
fn kill_process_group(name: &str, pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill {} worker process group: {}", name, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_name: &str, _pid: Option<u32>) {}

async fn handshake(
    provider: &str,
    session: &str,
    lines: &mut Lines<BufReader<ChildStdout>>,
    timeout: Duration,
) -> Result<()> {
    let line = match tokio::time::timeout(timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            return Err(Error::Handshake(format!(
                "{} worker closed stdout before the handshake",
                provider
            )))
        }
        Ok(Err(e)) => {
            return Err(Error::Handshake(format!(
                "failed to read {} worker handshake: {}",
                provider, e
            )))
        }
        Err(_) => {
            return Err(Error::Handshake(format!(
                "no handshake from {} worker within {}s",
                provider,
                timeout.as_secs()
            )))
        }
    };

    let handshake: Handshake = serde_json::from_str(&line)
        .map_err(|_| Error::Handshake(format!("{} worker sent an invalid handshake", provider)))?;
    verify_handshake(&handshake, provider, session)
}

fn verify_handshake(handshake: &Handshake, provider: &str, session: &str) -> Result<()> {
    if handshake.protocol_version != PROTOCOL_VERSION {
        return Err(Error::Handshake(format!(
            "protocol version mismatch: expected {}, worker speaks {}",
            PROTOCOL_VERSION, handshake.protocol_version
        )));
    }
    if handshake.cookie != MAGIC_COOKIE_VALUE || handshake.session != session {
        return Err(Error::Handshake("shared secret mismatch".to_string()));
    }
    if handshake.provider != provider {
        return Err(Error::Handshake(format!(
            "worker hosts {:?}, expected {:?}",
            handshake.provider, provider
        )));
    }
    Ok(())
}

async fn write_loop(name: String, mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to write to {} worker: {}", name, e);
            break;
        }
    }
    debug!("{} worker writer finished", name);
}

/// Just the id of a response whose reply could not be decoded.
#[derive(Deserialize)]
struct ResponseId {
    id: u64,
}

async fn read_loop<R: AsyncBufRead + Unpin>(
    name: String,
    mut lines: Lines<R>,
    pending: Arc<Mutex<Pending>>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let response: Response = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        fail_undecodable(&name, &line, &e, &pending);
                        continue;
                    }
                };
                let waiter = pending.lock().waiters.remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response.reply);
                    }
                    None => debug!(
                        "Discarding reply {} from {} worker (caller gone)",
                        response.id, name
                    ),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read from {} worker: {}", name, e);
                break;
            }
        }
    }

    let mut pending = pending.lock();
    pending.closed = true;
    pending.waiters.clear();
    debug!("{} worker reader finished", name);
}

/// Fail the caller waiting on an undecodable reply instead of leaving it
/// to time out.
fn fail_undecodable(name: &str, line: &str, err: &serde_json::Error, pending: &Mutex<Pending>) {
    let waiter = serde_json::from_str::<ResponseId>(line)
        .ok()
        .and_then(|r| pending.lock().waiters.remove(&r.id));
    match waiter {
        Some(tx) => {
            warn!("Undecodable reply from {} worker: {}", name, err);
            let _ = tx.send(Reply::Error(WireError {
                kind: ErrorKind::Process,
                message: format!("{} worker sent an undecodable reply: {}", name, err),
            }));
        }
        None => warn!("Ignoring malformed line from {} worker: {}", name, err),
    }
}

#[async_trait]
impl DnsProvider for ProviderProcess {
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.forward(Call::Present {
            domain: domain.to_string(),
            token: token.to_string(),
            key_auth: key_auth.to_string(),
        })
        .await
    }

    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.forward(Call::CleanUp {
            domain: domain.to_string(),
            token: token.to_string(),
            key_auth: key_auth.to_string(),
        })
        .await
    }

    fn timeout(&self) -> Option<Timeouts> {
        self.configured_info().ok().and_then(|info| info.timeout)
    }

    fn sequential(&self) -> Option<Duration> {
        self.configured_info().ok().and_then(|info| info.sequential())
    }
}
