//! Serving side of the RPC protocol.
//!
//! Bundle containers run [`PYTHON_RUNNER`] by default, which imports the
//! requested function from the extracted bundle. This module is the native
//! counterpart: the same protocol served from a registry of Rust handlers,
//! used by the `microfaas-runner` binary and by tests.
//!
//! The runner is started inside each bundle container. It announces itself
//! with a `ready` message, then reads one [`CallRequest`] per line and
//! answers each with zero or more `item`/`error` messages and one `end`.
//! Requests are dispatched concurrently; responses for different calls may
//! interleave, but the messages of one call are written as one batch.
//!
//! Handlers are registered once, at startup, in a [`FunctionRegistry`].
//! Each declares which `extras` keys it accepts ([`Params`]); undeclared
//! keys are dropped before the call.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::constants::RUNNER_PROTOCOL_VERSION;
use crate::error::{Error, Result};
use crate::rpc::protocol::{
    CallRequest, ErrorCode, RemoteError, RunnerMessage, is_valid_function_name,
};

/// Source of the default in-container runner. Resolves `module:attr` and
/// dotted names by importing them from the bundle directory (bare names
/// from the `app` module), filters `extras` by the function's signature and
/// streams generator results as separate items.
pub const PYTHON_RUNNER: &str = include_str!("../assets/runner.py");

// =============================================================================
// Handlers
// =============================================================================

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;
pub type SyncHandler =
    Arc<dyn Fn(Value, Map<String, Value>) -> anyhow::Result<Value> + Send + Sync>;
pub type AsyncHandler = Arc<dyn Fn(Value, Map<String, Value>) -> HandlerFuture + Send + Sync>;

/// Which `extras` keys a handler accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Params {
    /// Only these keys are passed through.
    Named(Vec<String>),
    /// Every key is passed through.
    Any,
}

impl Params {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Named(names.into_iter().map(Into::into).collect())
    }

    /// Drops keys the handler did not declare.
    pub fn filter(&self, extras: Map<String, Value>) -> Map<String, Value> {
        match self {
            Self::Any => extras,
            Self::Named(names) => extras
                .into_iter()
                .filter(|(k, _)| names.iter().any(|n| n == k))
                .collect(),
        }
    }
}

#[derive(Clone)]
pub enum Handler {
    /// Runs on the blocking pool.
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// A registered function.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub params: Params,
    pub handler: Handler,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.handler {
            Handler::Sync(_) => "sync",
            Handler::Async(_) => "async",
        };
        f.debug_struct("HandlerDescriptor")
            .field("params", &self.params)
            .field("handler", &kind)
            .finish()
    }
}

impl HandlerDescriptor {
    /// Filters `extras` and runs the handler. Panics become errors.
    pub async fn invoke(&self, body: Value, extras: Map<String, Value>) -> anyhow::Result<Value> {
        let extras = self.params.filter(extras);
        match &self.handler {
            Handler::Sync(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(body, extras))
                    .await
                    .map_err(|e| anyhow::anyhow!("handler panicked: {e}"))?
            }
            Handler::Async(f) => tokio::spawn(f(body, extras))
                .await
                .map_err(|e| anyhow::anyhow!("handler panicked: {e}"))?,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Functions the runner can serve, keyed by `module:object` name.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, HandlerDescriptor>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, descriptor: HandlerDescriptor) -> Result<()> {
        if !is_valid_function_name(name) {
            return Err(Error::Config(format!("invalid function name: {name}")));
        }
        self.functions.insert(name.to_string(), descriptor);
        Ok(())
    }

    pub fn register_sync<F>(&mut self, name: &str, params: Params, f: F) -> Result<()>
    where
        F: Fn(Value, Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(
            name,
            HandlerDescriptor {
                params,
                handler: Handler::Sync(Arc::new(f)),
            },
        )
    }

    pub fn register_async<F, Fut>(&mut self, name: &str, params: Params, f: F) -> Result<()>
    where
        F: Fn(Value, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: AsyncHandler =
            Arc::new(move |body: Value, extras: Map<String, Value>| -> HandlerFuture {
                Box::pin(f(body, extras))
            });
        self.register(
            name,
            HandlerDescriptor {
                params,
                handler: Handler::Async(handler),
            },
        )
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Looks up a function by name.
    ///
    /// `module:object` names are looked up directly. A dotted name without a
    /// colon is tried as-is, then at each split point from the right:
    /// `a.b.c` → `a.b:c` → `a:b.c`.
    pub fn resolve(&self, name: &str) -> std::result::Result<&HandlerDescriptor, RemoteError> {
        if !is_valid_function_name(name) {
            return Err(RemoteError {
                code: ErrorCode::InvalidRequest,
                message: format!("invalid function name: {name:?}"),
            });
        }
        if let Some(found) = self.functions.get(name) {
            return Ok(found);
        }
        if !name.contains(':') {
            let parts: Vec<&str> = name.split('.').collect();
            for split in (1..parts.len()).rev() {
                let candidate = format!("{}:{}", parts[..split].join("."), parts[split..].join("."));
                if let Some(found) = self.functions.get(&candidate) {
                    return Ok(found);
                }
            }
        }
        Err(RemoteError {
            code: ErrorCode::NotFound,
            message: format!("no function named {name}"),
        })
    }
}

// =============================================================================
// Serving
// =============================================================================

type SharedWriter<W> = Arc<Mutex<W>>;

async fn write_batch<W>(writer: &SharedWriter<W>, messages: &[RunnerMessage]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = String::new();
    for msg in messages {
        buf.push_str(&msg.to_json_line()?);
    }
    let mut writer = writer.lock().await;
    writer.write_all(buf.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn dispatch<W>(registry: Arc<FunctionRegistry>, writer: SharedWriter<W>, request: CallRequest)
where
    W: AsyncWrite + Unpin + Send,
{
    let id = request.id;
    let mut messages = Vec::with_capacity(2);
    match registry.resolve(&request.function) {
        Err(remote) => {
            debug!(id, function = %request.function, error = %remote, "Rejected call");
            messages.push(RunnerMessage::Error {
                id,
                code: remote.code,
                message: remote.message,
            });
        }
        Ok(descriptor) => {
            let descriptor = descriptor.clone();
            match descriptor.invoke(request.body, request.extras).await {
                Ok(Value::Null) => {}
                Ok(value) => messages.push(RunnerMessage::Item { id, value }),
                Err(e) => {
                    warn!(id, function = %request.function, error = %e, "Handler failed");
                    messages.push(RunnerMessage::error(
                        id,
                        ErrorCode::HandlerFailed,
                        format!("{e:#}"),
                    ));
                }
            }
        }
    }
    messages.push(RunnerMessage::End { id });

    if let Err(e) = write_batch(&writer, &messages).await {
        error!(id, error = %e, "Failed to write response");
    }
}

/// Serves requests from `reader` until EOF, then waits for in-flight calls.
pub async fn serve<R, W>(registry: Arc<FunctionRegistry>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
    write_batch(
        &writer,
        &[RunnerMessage::Ready {
            version: RUNNER_PROTOCOL_VERSION.to_string(),
        }],
    )
    .await?;
    info!(functions = registry.len(), "Runner ready");

    let mut lines = BufReader::new(reader).lines();
    let mut tasks = JoinSet::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match CallRequest::from_json(&line) {
            Ok(request) => {
                debug!(id = request.id, function = %request.function, "Received call");
                tasks.spawn(dispatch(registry.clone(), writer.clone(), request));
            }
            Err(e) => {
                // Answer under the id if one can be salvaged.
                let id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64))
                    .unwrap_or(0);
                warn!(id, error = %e, "Malformed request");
                write_batch(
                    &writer,
                    &[
                        RunnerMessage::error(id, ErrorCode::InvalidRequest, e.to_string()),
                        RunnerMessage::End { id },
                    ],
                )
                .await?;
            }
        }

        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!(error = %e, "Dispatch task failed");
            }
        }
    }

    debug!(in_flight = tasks.len(), "Request stream closed, draining");
    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "Dispatch task failed");
        }
    }
    Ok(())
}

/// Serves on the process's stdin/stdout.
pub async fn serve_stdio(registry: Arc<FunctionRegistry>) -> Result<()> {
    serve(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

// =============================================================================
// Built-in Functions
// =============================================================================

/// Functions every runner serves.
///
/// - `microfaas.builtins:echo` returns its body and extras
/// - `microfaas.builtins:greet` returns a greeting for `body.name`
/// - `microfaas.builtins:files` lists the entries of `path` (default `.`)
pub fn builtin_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    let registered = [
        registry.register_sync("microfaas.builtins:echo", Params::Any, |body, extras| {
            Ok(json!({ "body": body, "extras": extras }))
        }),
        registry.register_sync(
            "microfaas.builtins:greet",
            Params::named(["greeting"]),
            |body, extras| {
                let name = body.get("name").and_then(Value::as_str).unwrap_or("world");
                let greeting = extras
                    .get("greeting")
                    .and_then(Value::as_str)
                    .unwrap_or("Hello");
                Ok(json!(format!("{greeting}, {name}!")))
            },
        ),
        registry.register_sync(
            "microfaas.builtins:files",
            Params::named(["path"]),
            |_body, extras| {
                let path = extras.get("path").and_then(Value::as_str).unwrap_or(".");
                let mut names = std::fs::read_dir(path)?
                    .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                    .collect::<std::io::Result<Vec<_>>>()?;
                names.sort();
                Ok(json!(names))
            },
        ),
    ];
    for result in registered {
        if let Err(e) = result {
            error!(error = %e, "Failed to register builtin");
        }
    }
    registry
}
