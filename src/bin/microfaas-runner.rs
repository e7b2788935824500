//! microfaas-runner - in-container function server
//!
//! Speaks the newline-delimited JSON RPC protocol on stdin/stdout and serves
//! the built-in functions. Logs go to stderr. Bundles run the Python runner
//! by default; point `runtime.runner_binary` at this binary to serve the
//! built-ins from a base image without Python.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::error;

use microfaas::logging::setup_tracing;
use microfaas::runner::{builtin_registry, serve_stdio};

#[tokio::main]
async fn main() -> ExitCode {
    let structured = std::env::var_os("MICROFAAS_STRUCTURED_LOGGING").is_some();
    if let Err(e) = setup_tracing(structured) {
        eprintln!("microfaas-runner: {e}");
        return ExitCode::FAILURE;
    }

    match serve_stdio(Arc::new(builtin_registry())).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Runner failed");
            ExitCode::FAILURE
        }
    }
}
