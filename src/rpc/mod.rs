//! Newline-delimited JSON RPC between the host and the runner.
//!
//! - [`protocol`]: message types and function-name syntax, shared by both
//!   sides
//! - [`client`]: host-side client used by [`crate::runtime`]
//!
//! The serving side lives in [`crate::runner`].

pub mod client;
pub mod protocol;

pub use client::{CallOutcome, RpcClient, RpcReader, RpcWriter};
pub use protocol::{CallRequest, ErrorCode, RemoteError, RunnerMessage, is_valid_function_name};
