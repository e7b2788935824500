//! Shared fixtures for integration tests.
//!
//! [`FakeBuildah`] stands in for the buildah binary: it records every
//! invocation, answers `images`/`from`/`inspect`/`mount` with canned output,
//! and connects each spawned runner to an in-process [`runner::serve`] over
//! `tokio::io::duplex` pipes. In host mode it starts the runner command as
//! a real process instead, rooted in the mount directory.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::JoinHandle;

use microfaas::buildah::{BuildahCli, CommandOutput, ProcessExit, SpawnedProcess};
use microfaas::bundle::BundleArchive;
use microfaas::config::{BackoffConfig, RuntimeConfig};
use microfaas::rpc::CallOutcome;
use microfaas::runner::{self, FunctionRegistry, Params};
use microfaas::runtime::{FunctionRuntime, RuntimeFactory, RuntimeState};
use microfaas::{Error, Result};

pub const BASE_IMAGE_ID: &str = "3f6e1b8c9d2a4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7";

// =============================================================================
// Test Functions
// =============================================================================

/// Observations made by the functions in [`test_registry`].
#[derive(Debug, Default)]
pub struct Recorder {
    pub greeted: Mutex<Vec<Value>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub long_started: AtomicUsize,
    pub long_finished: AtomicUsize,
}

impl Recorder {
    pub fn greeted(&self) -> Vec<Value> {
        self.greeted.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn long_started(&self) -> usize {
        self.long_started.load(Ordering::SeqCst)
    }

    pub fn long_finished(&self) -> usize {
        self.long_finished.load(Ordering::SeqCst)
    }
}

/// How long `app:long` runs.
pub const LONG_CALL: Duration = Duration::from_millis(300);

/// `app:greet` records its body, `app:slow` sleeps while tracking how many
/// calls overlap, `app:long` runs for [`LONG_CALL`] counting starts and
/// completions, `app:fail` always errors.
pub fn test_registry(recorder: Arc<Recorder>) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    let greet = recorder.clone();
    registry
        .register_sync("app:greet", Params::Any, move |body, _extras| {
            greet.greeted.lock().unwrap().push(body.clone());
            let name = body.get("name").and_then(Value::as_str).unwrap_or("world");
            Ok(json!(format!("Hello, {name}!")))
        })
        .unwrap();

    let long = recorder.clone();
    registry
        .register_async("app:long", Params::Any, move |body, _extras| {
            let long = long.clone();
            async move {
                long.long_started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(LONG_CALL).await;
                long.long_finished.fetch_add(1, Ordering::SeqCst);
                Ok(body)
            }
        })
        .unwrap();

    let slow = recorder;
    registry
        .register_async("app:slow", Params::Any, move |body, _extras| {
            let slow = slow.clone();
            async move {
                let now = slow.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                slow.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                slow.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(body)
            }
        })
        .unwrap();

    registry
        .register_sync("app:fail", Params::Any, |_body, _extras| {
            Err(anyhow::anyhow!("boom"))
        })
        .unwrap();

    registry
}

// =============================================================================
// Fake Buildah
// =============================================================================

pub struct FakeBuildah {
    calls: Mutex<Vec<Vec<String>>>,
    root: TempDir,
    registry: Arc<FunctionRegistry>,
    next_container: AtomicUsize,
    fail_commands: Mutex<Vec<String>>,
    spawn_failures: AtomicUsize,
    runners: Mutex<VecDeque<oneshot::Sender<()>>>,
    spawned: AtomicUsize,
    live: Arc<AtomicUsize>,
    mute: AtomicBool,
    on_host: AtomicBool,
}

/// Counts itself in a live-runner tally for as long as it exists.
struct LiveRunner(Arc<AtomicUsize>);

impl LiveRunner {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for LiveRunner {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aborts an in-process runner when its exit future is dropped, the way
/// `kill_on_drop` does for a child process.
struct AbortOnDrop(JoinHandle<i32>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl FakeBuildah {
    pub fn new(registry: FunctionRegistry) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            root: tempfile::tempdir().unwrap(),
            registry: Arc::new(registry),
            next_container: AtomicUsize::new(1),
            fail_commands: Mutex::new(Vec::new()),
            spawn_failures: AtomicUsize::new(0),
            runners: Mutex::new(VecDeque::new()),
            spawned: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            mute: AtomicBool::new(false),
            on_host: AtomicBool::new(false),
        })
    }

    /// Runners spawned from now on keep their pipes open but never answer.
    pub fn mute_runners(&self) {
        self.mute.store(true, Ordering::SeqCst);
    }

    /// Runner commands spawned from now on run as real processes, with
    /// absolute paths that exist under [`root`](Self::root) rewritten to
    /// point there and `<root>/app` as working directory. `copy` also
    /// copies existing host files into the root.
    pub fn run_runners_on_host(&self) {
        self.on_host.store(true, Ordering::SeqCst);
    }

    /// Runners whose process (or task) has not finished or been killed.
    pub fn live_runners(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Host directory handed out by `mount`.
    pub fn root(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    /// Every recorded invocation, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose subcommand is `sub`.
    pub fn calls_to(&self, sub: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().map(String::as_str) == Some(sub))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Makes every later invocation of `sub` exit with status 125.
    pub fn fail_command(&self, sub: &str) {
        self.fail_commands.lock().unwrap().push(sub.to_string());
    }

    /// Makes the next `n` spawns fail to launch.
    pub fn fail_spawns(&self, n: usize) {
        self.spawn_failures.store(n, Ordering::SeqCst);
    }

    /// Runners spawned so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Kills every live runner as if it had crashed. Returns how many.
    pub fn kill_runners(&self) -> usize {
        let mut runners = self.runners.lock().unwrap();
        let mut killed = 0;
        while let Some(kill) = runners.pop_front() {
            if kill.send(()).is_ok() {
                killed += 1;
            }
        }
        killed
    }

    fn host_path(&self, arg: &str) -> String {
        if let Some(relative) = arg.strip_prefix('/') {
            let path = self.root.path().join(relative);
            if path.exists() {
                return path.display().to_string();
            }
        }
        arg.to_string()
    }

    /// `copy <ctr> <src> <dst>` into the mount root, when `src` exists.
    fn copy_into_root(&self, args: &[String]) {
        if let [_, _, src, dst] = args {
            let src = std::path::Path::new(src);
            if src.is_file() {
                let dst = self.root.path().join(dst.trim_start_matches('/'));
                std::fs::copy(src, dst).unwrap();
            }
        }
    }

    fn spawn_on_host(&self, args: &[String]) -> Result<SpawnedProcess> {
        let sep = args.iter().position(|a| a == "--").unwrap();
        let cmd: Vec<String> = args[sep + 2..].iter().map(|a| self.host_path(a)).collect();
        let mut child = tokio::process::Command::new(&cmd[0])
            .args(&cmd[1..])
            .current_dir(self.root.path().join("app"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: cmd[0].clone(),
                source,
            })?;
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let pid = child.id();

        let live = LiveRunner::enter(&self.live);
        let exit: ProcessExit = Box::pin(async move {
            let _live = live;
            Ok::<_, std::io::Error>(child.wait().await?.code())
        });
        Ok(SpawnedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit,
            pid,
        })
    }

    fn inspect_output() -> String {
        let config = json!({
            "config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin", "LANG=C.UTF-8"],
                "Cmd": ["python3"],
                "WorkingDir": "/",
                "Labels": {"maintainer": "upstream"},
            }
        });
        json!({ "Config": config.to_string() }).to_string()
    }
}

#[async_trait]
impl BuildahCli for FakeBuildah {
    async fn exec(&self, args: Vec<String>, _input: Option<Vec<u8>>) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(args.clone());
        let sub = args.first().cloned().unwrap_or_default();
        if self.fail_commands.lock().unwrap().contains(&sub) {
            return Err(Error::CommandFailed {
                command: format!("buildah {}", args.join(" ")),
                code: Some(125),
                stdout: String::new(),
                stderr: format!("{sub}: simulated failure"),
            });
        }

        if sub == "copy" && self.on_host.load(Ordering::SeqCst) {
            self.copy_into_root(&args);
        }

        let stdout = match sub.as_str() {
            "images" => json!([
                {"id": BASE_IMAGE_ID, "names": ["docker.io/library/python:3"]}
            ])
            .to_string(),
            "pull" => format!("{BASE_IMAGE_ID}\n"),
            "from" => format!(
                "fake-ctr-{}\n",
                self.next_container.fetch_add(1, Ordering::SeqCst)
            ),
            "inspect" => Self::inspect_output(),
            "mount" => format!("{}\n", self.root.path().display()),
            "commit" => "sha256:committed\n".to_string(),
            _ => String::new(),
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
        })
    }

    fn spawn(&self, args: Vec<String>) -> Result<SpawnedProcess> {
        self.calls.lock().unwrap().push(args.clone());
        let remaining = self.spawn_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.spawn_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Spawn {
                program: "buildah".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "simulated"),
            });
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        if self.on_host.load(Ordering::SeqCst) {
            return self.spawn_on_host(&args);
        }

        let (host_out, runner_in) = tokio::io::duplex(64 * 1024);
        let (runner_out, host_in) = tokio::io::duplex(64 * 1024);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.runners.lock().unwrap().push_back(kill_tx);

        let registry = self.registry.clone();
        let mute = self.mute.load(Ordering::SeqCst);
        let live = LiveRunner::enter(&self.live);
        let task = tokio::spawn(async move {
            let _live = live;
            let serve = async move {
                if mute {
                    let _pipes = (runner_in, runner_out);
                    std::future::pending::<i32>().await
                } else if runner::serve(registry, runner_in, runner_out).await.is_ok() {
                    0
                } else {
                    1
                }
            };
            tokio::select! {
                code = serve => code,
                _ = kill_rx => 137,
            }
        });
        let runner = AbortOnDrop(task);
        let exit: ProcessExit = Box::pin(async move {
            let mut runner = runner;
            (&mut runner.0)
                .await
                .map(Some)
                .map_err(std::io::Error::other)
        });

        Ok(SpawnedProcess {
            stdin: Box::new(host_out),
            stdout: Box::new(host_in),
            exit,
            pid: None,
        })
    }
}

// =============================================================================
// Fake Runtimes
// =============================================================================

/// A job as seen by a [`FakeRuntime`]: which runtime ran it, and its body.
pub type Delivery = (String, Value);

/// In-memory runtime. Calls to `fail` return an error; every other call
/// echoes its body. A gated runtime holds each call until a permit arrives.
/// Shutting down fails the call in flight, as stopping a real runner does.
pub struct FakeRuntime {
    id: String,
    delivered: Arc<Mutex<Vec<Delivery>>>,
    started: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
    stopped: watch::Sender<bool>,
}

impl FakeRuntime {
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }
}

#[async_trait]
impl FunctionRuntime for FakeRuntime {
    async fn call(
        &self,
        function: &str,
        body: &Value,
        _extras: &Map<String, Value>,
    ) -> Result<CallOutcome> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut stopped = self.stopped.subscribe();
        if let Some(gate) = &self.gate {
            let stop = async {
                let _ = stopped.wait_for(|s| *s).await;
            };
            tokio::select! {
                permit = gate.acquire() => {
                    permit.map_err(|e| Error::Internal(e.to_string()))?.forget();
                }
                () = stop => {}
            }
        }
        if self.is_stopped() {
            return Err(Error::InvalidState {
                state: RuntimeState::Stopped.to_string(),
                expected: RuntimeState::Ready.to_string(),
            });
        }
        if function == "fail" {
            return Err(Error::RetriesExhausted {
                operation: format!("call {function}"),
                attempts: 1,
                last_error: "simulated".to_string(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .push((self.id.clone(), body.clone()));
        Ok(CallOutcome {
            items: vec![body.clone()],
            errors: Vec::new(),
        })
    }

    async fn shutdown(&self) {
        self.stopped.send_replace(true);
    }

    fn state(&self) -> RuntimeState {
        if self.is_stopped() {
            RuntimeState::Stopped
        } else {
            RuntimeState::Ready
        }
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Launches [`FakeRuntime`]s named `rt-1`, `rt-2`, ...
#[derive(Default)]
pub struct FakeFactory {
    delivered: Arc<Mutex<Vec<Delivery>>>,
    started: Arc<AtomicUsize>,
    runtimes: Mutex<Vec<Arc<FakeRuntime>>>,
    call_gate: Mutex<Option<Arc<Semaphore>>>,
    launch_gate: Mutex<Option<Arc<Semaphore>>>,
    fail_next: AtomicBool,
    digests: Mutex<Vec<String>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runtimes launched from now on hold calls until permits are added to
    /// the returned gate. `None` clears it.
    pub fn gate_calls(&self, gate: Option<Arc<Semaphore>>) {
        *self.call_gate.lock().unwrap() = gate;
    }

    /// Launches wait for a permit on `gate`. `None` clears it.
    pub fn gate_launches(&self, gate: Option<Arc<Semaphore>>) {
        *self.launch_gate.lock().unwrap() = gate;
    }

    /// The next launch fails.
    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<Delivery> {
        self.delivered.lock().unwrap().clone()
    }

    /// Calls that reached a runtime, finished or not.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn runtime(&self, index: usize) -> Arc<FakeRuntime> {
        self.runtimes.lock().unwrap()[index].clone()
    }

    pub fn launched(&self) -> usize {
        self.runtimes.lock().unwrap().len()
    }

    pub fn digests(&self) -> Vec<String> {
        self.digests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeFactory for FakeFactory {
    async fn launch(
        &self,
        _name: &str,
        archive: &BundleArchive,
    ) -> Result<Arc<dyn FunctionRuntime>> {
        let launch_gate = self.launch_gate.lock().unwrap().clone();
        if let Some(gate) = launch_gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .forget();
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::RetriesExhausted {
                operation: "runner startup".to_string(),
                attempts: 1,
                last_error: "simulated".to_string(),
            });
        }

        self.digests.lock().unwrap().push(archive.digest().to_string());
        let mut runtimes = self.runtimes.lock().unwrap();
        let runtime = Arc::new(FakeRuntime {
            id: format!("rt-{}", runtimes.len() + 1),
            delivered: self.delivered.clone(),
            started: self.started.clone(),
            gate: self.call_gate.lock().unwrap().clone(),
            stopped: watch::channel(false).0,
        });
        runtimes.push(runtime.clone());
        Ok(runtime)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Runtime settings with short timeouts and a fast backoff.
pub fn fast_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        runner_binary: Some(PathBuf::from("/opt/microfaas/microfaas-runner")),
        ready_timeout_secs: 2,
        call_timeout_secs: 2,
        backoff: BackoffConfig {
            initial_ms: 5,
            max_ms: 20,
            max_attempts: 5,
        },
        ..RuntimeConfig::default()
    }
}

/// Builds a zip archive in memory from `(name, contents)` pairs.
pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, contents) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// The demo bundle. `greet` appends each body it receives to `calls.log`
/// in the working directory.
pub const DEMO_APP: &str = r#"import json


def greet(body):
    with open("calls.log", "a") as log:
        log.write(json.dumps(body) + "\n")
    return f"Hello, {body['name']}!"


def count(body, step=1):
    for n in range(0, body, step):
        yield n


async def shout(body, **extras):
    return {"text": body.upper(), "extras": sorted(extras)}


def fail(body):
    raise RuntimeError("boom")
"#;

pub fn demo_bundle() -> Vec<u8> {
    zip_bytes(&[("app.py", DEMO_APP), ("requirements.txt", "")])
}

/// Whether a `python3` interpreter is available on this host.
pub fn has_python3() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
