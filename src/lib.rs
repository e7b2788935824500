//! # microfaas
//!
//! **Lightweight function-as-a-service orchestrator on unprivileged buildah
//! containers**
//!
//! Each deployed *bundle* (a zip archive of application code) gets its own
//! job queue, a consumer task draining it, and a runtime: a buildah working
//! container with the bundle extracted into it and a runner subprocess that
//! serves function calls over newline-delimited JSON on its stdin/stdout.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       Orchestrator (context)                        │
//! │      HTTP control plane (server) ─► Manager ◄─ CLI (bin/microfaas)  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────────────────────────────────────────┐  │
//! │  │                          Manager                              │  │
//! │  │  deploy(name, zip) │ call(name, fn, body) │ join │ delete     │  │
//! │  │    per bundle: JobQueue ─► consumer task ─► current runtime   │  │
//! │  └───────────────────────────────┬───────────────────────────────┘  │
//! │                                  │ FunctionRuntime                  │
//! │  ┌───────────────────────────────┼───────────────────────────────┐  │
//! │  │                          Runtime                              │  │
//! │  │  bootstrap container │ supervisor (respawn + backoff)         │  │
//! │  │  call lock │ bounded transport retries                        │  │
//! │  └───────────────┬───────────────────────────────┬───────────────┘  │
//! │                  │ RpcClient (rpc)               │ Container        │
//! │                  ▼                               ▼                  │
//! │  ┌──────────────────────────┐   ┌────────────────────────────────┐  │
//! │  │ runner (in container)    │   │ buildah engine                 │  │
//! │  │ FunctionRegistry, serve  │   │ config diff │ mount │ run      │  │
//! │  └──────────────────────────┘   └────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **No job loss across redeploy**: a redeploy swaps the runtime under the
//!   existing queue and consumer.
//! - **One call in flight per runtime**: calls are serialized by a lock.
//! - **Bounded retries**: transport failures are retried with capped
//!   exponential backoff ([`backoff`]), then surfaced as
//!   [`Error::RetriesExhausted`].
//! - **Cleanup**: a failed bootstrap removes its container; teardown never
//!   propagates errors, it logs them.
//!
//! # Security
//!
//! - **Path Traversal Protection**: bundle entries that would land outside
//!   the application directory are rejected ([`bundle::extract_archive`]).
//! - **Size Limits**: archive size, uncompressed size, entry count and RPC
//!   line length are bounded (see [`constants`]).
//! - **Unprivileged**: containers run inside a `buildah unshare` user
//!   namespace; the binary re-executes itself there when needed.
//!
//! # Example
//!
//! ```rust,ignore
//! use microfaas::{BundleSource, Orchestrator, OrchestratorConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> microfaas::Result<()> {
//!     let orch = Orchestrator::start(OrchestratorConfig::default())?;
//!     let manager = orch.manager();
//!     manager
//!         .deploy("demo", BundleSource::Path("bundle.zip".into()))
//!         .await?;
//!     manager.call("demo", "app:greet", json!({"name": "x"}), Default::default())?;
//!     manager.join().await;
//!     orch.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod buildah;
pub mod bundle;
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod logging;
pub mod manager;
pub mod queue;
pub mod rpc;
pub mod runner;
pub mod runtime;
pub mod server;

// Re-exports
pub use backoff::{Backoff, retry_with_backoff};
pub use buildah::{BuildahCli, Container, ContainerConfig, Image, RunOptions, SystemBuildah};
pub use bundle::{BundleArchive, BundleSource};
pub use config::{BackoffConfig, OrchestratorConfig, RuntimeConfig};
pub use context::Orchestrator;
pub use error::{Error, Result};
pub use manager::{BundleInfo, Manager};
pub use queue::{Job, JobQueue};
pub use rpc::{CallOutcome, RpcClient};
pub use runner::{FunctionRegistry, Handler, HandlerDescriptor, Params};
pub use runtime::{
    ContainerRuntimeFactory, FunctionRuntime, Runtime, RuntimeFactory, RuntimeState,
};
