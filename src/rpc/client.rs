//! Host-side RPC client.
//!
//! One [`RpcClient`] wraps the stdin/stdout pair of one runner process.
//! Calls are serialized by an internal lock; each waits for the runner's
//! `end` message before releasing it. Messages tagged with another call's id
//! (left over from a call that timed out) are discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::protocol::{CallRequest, RemoteError, RunnerMessage};
use crate::constants::{MAX_RPC_LINE_LEN, RUNNER_PROTOCOL_VERSION};
use crate::error::{Error, Result};

pub type RpcReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RpcWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything a call's response stream carried.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallOutcome {
    pub items: Vec<Value>,
    pub errors: Vec<RemoteError>,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Channel {
    reader: BufReader<RpcReader>,
    writer: RpcWriter,
}

impl Channel {
    /// Reads one protocol line. EOF means the runner went away.
    async fn read_message(&mut self) -> Result<RunnerMessage> {
        loop {
            let mut line = String::new();
            let limit = (MAX_RPC_LINE_LEN + 1) as u64;
            let n = (&mut self.reader).take(limit).read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            if line.len() > MAX_RPC_LINE_LEN {
                return Err(Error::Protocol(format!(
                    "line exceeds {MAX_RPC_LINE_LEN} bytes"
                )));
            }
            if line.trim().is_empty() {
                continue;
            }
            return RunnerMessage::from_json(&line)
                .map_err(|e| Error::Protocol(format!("malformed message: {e}")));
        }
    }

    async fn send(&mut self, request: &CallRequest) -> Result<()> {
        let line = request.to_json_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Client for one runner process.
pub struct RpcClient {
    channel: Mutex<Channel>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn new(writer: RpcWriter, reader: RpcReader) -> Self {
        Self {
            channel: Mutex::new(Channel {
                reader: BufReader::new(reader),
                writer,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Waits for the runner's `ready` message and returns its version.
    pub async fn handshake(&self, timeout: Duration) -> Result<String> {
        let mut channel = self.channel.lock().await;
        let msg = tokio::time::timeout(timeout, channel.read_message())
            .await
            .map_err(|_| Error::Timeout {
                operation: "runner handshake".to_string(),
                duration: timeout,
            })??;
        match msg {
            RunnerMessage::Ready { version } => {
                if version != RUNNER_PROTOCOL_VERSION {
                    warn!(
                        version = %version,
                        expected = RUNNER_PROTOCOL_VERSION,
                        "Runner speaks a different protocol version"
                    );
                }
                Ok(version)
            }
            other => Err(Error::Protocol(format!(
                "expected ready message, got {other:?}"
            ))),
        }
    }

    /// Invokes `function` and drains its response stream.
    ///
    /// Runner-reported errors are collected into the outcome, not raised.
    ///
    /// # Errors
    ///
    /// Transport failures only: [`Error::Disconnected`], [`Error::Protocol`],
    /// [`Error::Timeout`], [`Error::Io`].
    pub async fn call(
        &self,
        function: &str,
        body: &Value,
        extras: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<CallOutcome> {
        let mut channel = self.channel.lock().await;
        let request = CallRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            function: function.to_string(),
            body: body.clone(),
            extras: extras.clone(),
        };

        tokio::time::timeout(timeout, Self::round_trip(&mut channel, &request))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("call {function}"),
                duration: timeout,
            })?
    }

    async fn round_trip(channel: &mut Channel, request: &CallRequest) -> Result<CallOutcome> {
        channel.send(request).await?;

        let mut outcome = CallOutcome::default();
        loop {
            let msg = channel.read_message().await?;
            if msg.id() != Some(request.id) {
                debug!(expected = request.id, got = ?msg.id(), "Discarding stale runner message");
                continue;
            }
            match msg {
                RunnerMessage::Item { value, .. } => outcome.items.push(value),
                RunnerMessage::Error { code, message, .. } => {
                    outcome.errors.push(RemoteError { code, message })
                }
                RunnerMessage::End { .. } => return Ok(outcome),
                RunnerMessage::Ready { .. } => {}
            }
        }
    }

    /// Closes the request side; a well-behaved runner exits on EOF.
    pub async fn close(&self) {
        let mut channel = self.channel.lock().await;
        if let Err(e) = channel.writer.shutdown().await {
            debug!(error = %e, "Closing runner stdin failed");
        }
    }
}
