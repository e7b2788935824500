//! Bundle runtimes.
//!
//! A [`Runtime`] owns one buildah working container with a bundle extracted
//! into it, plus the runner process serving RPC calls from inside that
//! container. The manager only sees the [`FunctionRuntime`] trait, so tests
//! can substitute runtimes that never touch buildah.
//!
//! # Lifecycle
//!
//! ```text
//!                          runner ready
//!   ┌───────────────┐    ─────────────►   ┌─────────┐
//!   │ Bootstrapping │                     │  Ready  │ ◄──────────┐
//!   └───────┬───────┘                     └────┬────┘            │
//!           │                    runner exits  │                 │ runner ready
//!           │  max_attempts                    ▼                 │
//!           │  failed launches         ┌──────────────┐          │
//!           ▼                          │ Reconnecting │ ─────────┘
//!      ┌────────┐                      └──────────────┘
//!      │ Failed │
//!      └────────┘        shutdown() from any state ──► Stopped (terminal)
//! ```
//!
//! Only bootstrap can fail. Once a runner has been ready, the supervisor
//! keeps relaunching it with capped backoff until shutdown. The backoff
//! starts over after a runner stayed up for [`RUNNER_MIN_UPTIME`].
//!
//! # Bootstrap
//!
//! 1. create a working container from the base image
//! 2. mount it, create the application directory, extract the bundle
//! 3. set the working directory (and bundle labels)
//! 4. run the install command, if configured
//! 5. copy the runner entrypoint into the container (the bundled Python
//!    runner unless a custom one is configured)
//! 6. start the supervisor and wait for the first `ready` message
//!
//! A failure in any step removes the container before the error is returned.
//! A runtime dropped without [`shutdown`](FunctionRuntime::shutdown),
//! including a `start` future cancelled midway, stops its supervisor and
//! removes its container in the background.
//!
//! # Calls
//!
//! Calls are serialized by a per-runtime lock, so at most one is in flight
//! on the RPC channel. Transport failures are retried with backoff, waiting
//! for the supervisor to bring a runner back; errors the runner reports are
//! returned in the [`CallOutcome`]. Shutdown waits for the call in flight
//! before it stops the runner.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, retry_with_backoff};
use crate::buildah::{BuildahCli, Container, ProcessExit, RunOptions};
use crate::bundle::BundleArchive;
use crate::config::RuntimeConfig;
use crate::constants::{BUNDLE_LABEL, DIGEST_LABEL, RUNNER_CLOSE_TIMEOUT, RUNNER_MIN_UPTIME};
use crate::error::{Error, Result};
use crate::rpc::{CallOutcome, RpcClient};
use crate::runner::PYTHON_RUNNER;

// =============================================================================
// Runtime State
// =============================================================================

/// Runtime lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    /// Container being prepared, runner not yet ready.
    Bootstrapping,
    /// Runner connected and accepting calls.
    Ready,
    /// Runner exited; the supervisor is relaunching it.
    Reconnecting,
    /// No runner ever became ready; bootstrap gave up.
    Failed,
    /// Torn down.
    Stopped,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Ready => write!(f, "ready"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Something that executes a bundle's functions.
#[async_trait]
pub trait FunctionRuntime: Send + Sync {
    /// Invokes `function` and waits for its full response stream.
    ///
    /// # Errors
    ///
    /// [`Error::RetriesExhausted`] once transport retries run out,
    /// [`Error::InvalidState`] if the runtime is stopped or failed.
    async fn call(
        &self,
        function: &str,
        body: &Value,
        extras: &Map<String, Value>,
    ) -> Result<CallOutcome>;

    /// Releases every resource. Idempotent; failures are logged.
    async fn shutdown(&self);

    fn state(&self) -> RuntimeState;

    /// Identifier for logs (the container id for container runtimes).
    fn id(&self) -> &str;
}

/// Builds and bootstraps runtimes for the manager.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    /// Returns a runtime that is ready to serve calls.
    async fn launch(&self, name: &str, archive: &BundleArchive)
    -> Result<Arc<dyn FunctionRuntime>>;
}

/// Launches [`Runtime`]s in buildah containers.
pub struct ContainerRuntimeFactory {
    cli: Arc<dyn BuildahCli>,
    config: RuntimeConfig,
}

impl ContainerRuntimeFactory {
    pub fn new(cli: Arc<dyn BuildahCli>, config: RuntimeConfig) -> Self {
        Self { cli, config }
    }
}

#[async_trait]
impl RuntimeFactory for ContainerRuntimeFactory {
    async fn launch(
        &self,
        name: &str,
        archive: &BundleArchive,
    ) -> Result<Arc<dyn FunctionRuntime>> {
        let runtime = Runtime::start(self.cli.clone(), self.config.clone(), name, archive).await?;
        Ok(Arc::new(runtime))
    }
}

// =============================================================================
// Container Runtime
// =============================================================================

/// What the supervisor publishes to callers.
#[derive(Debug, Clone)]
struct Link {
    state: RuntimeState,
    client: Option<Arc<RpcClient>>,
    last_error: Option<String>,
}

impl Link {
    fn mark(&mut self, state: RuntimeState) {
        if self.state != RuntimeState::Stopped {
            self.state = state;
        }
    }
}

/// A bundle running in a buildah container.
pub struct Runtime {
    name: String,
    container_id: String,
    container: Arc<Mutex<Container>>,
    link: Arc<watch::Sender<Link>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    call_lock: Mutex<()>,
    backoff: Backoff,
    config: RuntimeConfig,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.name)
            .field("container", &self.container_id)
            .field("state", &self.link.borrow().state)
            .finish()
    }
}

impl Runtime {
    /// Bootstraps a runtime for `archive` and waits until its runner is
    /// ready.
    pub async fn start(
        cli: Arc<dyn BuildahCli>,
        config: RuntimeConfig,
        name: &str,
        archive: &BundleArchive,
    ) -> Result<Self> {
        let runner = RunnerFile::for_config(&config)?;

        let mut container = Container::from_image(cli, &config.base_image, &[]).await?;
        if let Err(e) = prepare(&mut container, &config, name, archive, runner.path()).await {
            error!(bundle = %name, container = %container.id(), error = %e, "Bootstrap failed");
            container.remove().await;
            return Err(e);
        }

        let container_id = container.id().to_string();
        let (tx, mut rx) = watch::channel(Link {
            state: RuntimeState::Bootstrapping,
            client: None,
            last_error: None,
        });
        let runtime = Self {
            name: name.to_string(),
            container_id,
            container: Arc::new(Mutex::new(container)),
            link: Arc::new(tx),
            supervisor: std::sync::Mutex::new(None),
            call_lock: Mutex::new(()),
            backoff: Backoff::from(&config.backoff),
            config,
        };

        let supervisor = Supervisor {
            name: runtime.name.clone(),
            container: runtime.container.clone(),
            link: runtime.link.clone(),
            command: runtime.config.runner_command(),
            ready_timeout: runtime.config.ready_timeout(),
            backoff: runtime.backoff,
            max_attempts: runtime.config.backoff.max_attempts,
        };
        runtime.set_supervisor(tokio::spawn(supervisor.run()));

        let first = rx
            .wait_for(|l| matches!(l.state, RuntimeState::Ready | RuntimeState::Failed))
            .await
            .map(|l| l.clone());
        match first {
            Ok(Link {
                state: RuntimeState::Ready,
                ..
            }) => {
                info!(bundle = %runtime.name, container = %runtime.container_id, "Runtime ready");
                Ok(runtime)
            }
            Ok(link) => {
                runtime.shutdown().await;
                Err(Error::RetriesExhausted {
                    operation: "runner startup".to_string(),
                    attempts: runtime.config.backoff.max_attempts,
                    last_error: link.last_error.unwrap_or_else(|| "unknown".to_string()),
                })
            }
            Err(_) => {
                runtime.shutdown().await;
                Err(Error::Internal("runtime state channel closed".to_string()))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn set_supervisor(&self, handle: JoinHandle<()>) {
        match self.supervisor.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        match self.supervisor.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Waits for a connected runner.
    async fn ready_client(&self) -> Result<Arc<RpcClient>> {
        let mut rx = self.link.subscribe();
        let timeout = self.config.ready_timeout();
        let link = tokio::time::timeout(
            timeout,
            rx.wait_for(|l| {
                l.client.is_some() || matches!(l.state, RuntimeState::Failed | RuntimeState::Stopped)
            }),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "waiting for runner".to_string(),
            duration: timeout,
        })?
        .map_err(|_| Error::Disconnected)?
        .clone();

        match link {
            Link {
                state: RuntimeState::Ready,
                client: Some(client),
                ..
            } => Ok(client),
            Link { state, .. } => Err(Error::InvalidState {
                state: state.to_string(),
                expected: RuntimeState::Ready.to_string(),
            }),
        }
    }

    async fn attempt(
        &self,
        function: &str,
        body: &Value,
        extras: &Map<String, Value>,
    ) -> Result<CallOutcome> {
        let client = self.ready_client().await?;
        client
            .call(function, body, extras, self.config.call_timeout())
            .await
    }
}

#[async_trait]
impl FunctionRuntime for Runtime {
    async fn call(
        &self,
        function: &str,
        body: &Value,
        extras: &Map<String, Value>,
    ) -> Result<CallOutcome> {
        let _guard = self.call_lock.lock().await;

        let max_attempts = self.config.backoff.max_attempts;
        let operation = format!("call {function}");
        let result = retry_with_backoff(
            max_attempts.saturating_sub(1),
            self.backoff,
            &operation,
            || self.attempt(function, body, extras),
            Error::is_transport,
        )
        .await;

        match result {
            Ok(outcome) => {
                for remote in &outcome.errors {
                    warn!(bundle = %self.name, function, error = %remote, "Function reported an error");
                }
                debug!(bundle = %self.name, function, items = outcome.items.len(), "Call finished");
                Ok(outcome)
            }
            Err(e) if e.is_transport() => Err(Error::RetriesExhausted {
                operation,
                attempts: max_attempts,
                last_error: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self) {
        let mut was_stopped = false;
        let mut client = None;
        self.link.send_modify(|l| {
            was_stopped = l.state == RuntimeState::Stopped;
            l.state = RuntimeState::Stopped;
            client = l.client.take();
        });

        // A call already on the channel finishes before the runner goes away.
        let drained =
            tokio::time::timeout(self.config.call_timeout(), self.call_lock.lock()).await;
        if drained.is_err() {
            warn!(bundle = %self.name, "Call still in flight, stopping runner anyway");
        }
        let _drained = drained.ok();

        // EOF on stdin lets the runner exit on its own.
        if let Some(client) = client {
            if tokio::time::timeout(RUNNER_CLOSE_TIMEOUT, client.close())
                .await
                .is_err()
            {
                debug!(bundle = %self.name, "Runner channel busy, not closed");
            }
        }

        if let Some(handle) = self.take_supervisor() {
            handle.abort();
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(bundle = %self.name, error = %e, "Supervisor panicked");
                }
            }
        }

        // Removal is idempotent, so a repeat shutdown retries a failed rm.
        self.container.lock().await.remove().await;
        if !was_stopped {
            info!(bundle = %self.name, container = %self.container_id, "Runtime stopped");
        }
    }

    fn state(&self) -> RuntimeState {
        self.link.borrow().state
    }

    fn id(&self) -> &str {
        &self.container_id
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // The container goes with the last reference, once the aborted
        // supervisor releases its own.
        if let Some(handle) = self.take_supervisor() {
            debug!(bundle = %self.name, "Runtime dropped, stopping supervisor");
            handle.abort();
        }
    }
}

/// Host file copied into the container as the runner entrypoint.
enum RunnerFile {
    Custom(PathBuf),
    Bundled(tempfile::NamedTempFile),
}

impl RunnerFile {
    fn for_config(config: &RuntimeConfig) -> Result<Self> {
        if let Some(path) = &config.runner_binary {
            return Ok(Self::Custom(path.clone()));
        }
        let mut file = tempfile::Builder::new()
            .prefix("microfaas-runner-")
            .suffix(".py")
            .tempfile()?;
        file.write_all(PYTHON_RUNNER.as_bytes())?;
        file.flush()?;
        Ok(Self::Bundled(file))
    }

    fn path(&self) -> &Path {
        match self {
            Self::Custom(path) => path,
            Self::Bundled(file) => file.path(),
        }
    }
}

/// Bootstrap steps 2 through 5.
async fn prepare(
    container: &mut Container,
    config: &RuntimeConfig,
    name: &str,
    archive: &BundleArchive,
    runner: &Path,
) -> Result<()> {
    let mount = container.mount().await?;
    let app_dir = mount.path().join(config.app_dir.trim_start_matches('/'));
    let extracted = async {
        tokio::fs::create_dir_all(&app_dir).await?;
        archive.extract_to(app_dir.clone()).await
    }
    .await;
    let unmounted = mount.unmount().await;
    let stats = extracted?;
    unmounted?;
    info!(
        bundle = %name,
        container = %container.id(),
        files = stats.files,
        bytes = stats.bytes,
        "Extracted bundle"
    );

    container.config.workdir = config.app_dir.clone();
    container
        .config
        .labels
        .insert(BUNDLE_LABEL.to_string(), name.to_string());
    container
        .config
        .labels
        .insert(DIGEST_LABEL.to_string(), archive.digest().to_string());
    container.commit_config().await?;

    if let Some(install) = &config.install_command {
        info!(bundle = %name, command = ?install, "Installing runner dependencies");
        container.run(install, RunOptions::default()).await?;
    }

    container.copy_in(runner, &config.runner_path).await?;
    Ok(())
}

// =============================================================================
// Supervisor
// =============================================================================

/// Launches the runner, publishes its client, and relaunches it when it
/// exits.
struct Supervisor {
    name: String,
    container: Arc<Mutex<Container>>,
    link: Arc<watch::Sender<Link>>,
    command: Vec<String>,
    ready_timeout: Duration,
    backoff: Backoff,
    /// Launch failures tolerated before the first runner is ready.
    max_attempts: u32,
}

impl Supervisor {
    async fn run(self) {
        let mut failures: u32 = 0;
        let mut connected_once = false;
        let mut delay = self.backoff.initial_delay();

        loop {
            match self.launch().await {
                Ok((exit, client)) => {
                    failures = 0;
                    connected_once = true;
                    self.link.send_modify(|l| {
                        if l.state != RuntimeState::Stopped {
                            l.state = RuntimeState::Ready;
                            l.client = Some(client);
                            l.last_error = None;
                        }
                    });
                    debug!(bundle = %self.name, "Runner connected");

                    let up_since = Instant::now();
                    let status = exit.await;
                    self.link.send_modify(|l| {
                        l.mark(RuntimeState::Reconnecting);
                        l.client = None;
                    });
                    match status {
                        Ok(code) => warn!(bundle = %self.name, code = ?code, "Runner exited"),
                        Err(e) => warn!(bundle = %self.name, error = %e, "Lost runner process"),
                    }
                    delay = delay_after_exit(&self.backoff, delay, up_since.elapsed());
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        bundle = %self.name,
                        attempt = failures,
                        error = %e,
                        "Runner failed to start"
                    );
                    if !connected_once && failures >= self.max_attempts {
                        error!(bundle = %self.name, attempts = failures, "Giving up on runner");
                        self.link.send_modify(|l| {
                            l.mark(RuntimeState::Failed);
                            l.client = None;
                            l.last_error = Some(e.to_string());
                        });
                        return;
                    }
                    self.link.send_modify(|l| {
                        if l.state == RuntimeState::Ready {
                            l.state = RuntimeState::Reconnecting;
                        }
                        l.last_error = Some(e.to_string());
                    });
                }
            }

            if self.link.borrow().state == RuntimeState::Stopped {
                return;
            }
            tokio::time::sleep(delay).await;
            delay = self.backoff.next_delay(delay);
        }
    }

    /// Spawns the runner and completes the readiness handshake.
    async fn launch(&self) -> Result<(ProcessExit, Arc<RpcClient>)> {
        let (exit, client) = {
            let mut container = self.container.lock().await;
            container
                .popen_with_protocol(
                    |stdin, stdout| Arc::new(RpcClient::new(stdin, stdout)),
                    &self.command,
                    &RunOptions::default(),
                )
                .await?
        };
        // Dropping `exit` on failure kills the process.
        let version = client.handshake(self.ready_timeout).await?;
        debug!(bundle = %self.name, version = %version, "Runner handshake complete");
        Ok((exit, client))
    }
}

/// Delay before relaunching a runner that exited after `uptime`. Only a
/// runner that stayed up for [`RUNNER_MIN_UPTIME`] resets the backoff.
fn delay_after_exit(backoff: &Backoff, current: Duration, uptime: Duration) -> Duration {
    if uptime >= RUNNER_MIN_UPTIME {
        backoff.initial_delay()
    } else {
        current
    }
}
