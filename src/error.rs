//! Error types for the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while deploying, calling or tearing down bundles.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Bundle / Manager Errors
    // =========================================================================
    /// No bundle is registered under this name.
    #[error("unknown bundle: {0}")]
    BundleNotFound(String),

    /// Bundle name failed validation.
    #[error("invalid bundle name '{name}': {reason}")]
    InvalidBundleName { name: String, reason: String },

    /// Bundle archive could not be read.
    #[error("invalid bundle archive: {0}")]
    Archive(String),

    /// Archive entry would land outside the application directory.
    #[error("path traversal detected in bundle: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Container CLI Errors
    // =========================================================================
    /// The container CLI exited with a non-zero status.
    #[error("command `{command}` failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The container CLI could not be launched at all.
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Container metadata did not have the expected shape.
    #[error("unexpected metadata for container '{id}': {reason}")]
    InvalidMetadata { id: String, reason: String },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Image is neither available locally nor pullable.
    #[error("could not find image {0}")]
    ImageNotFound(String),

    // =========================================================================
    // Runtime / RPC Errors
    // =========================================================================
    /// The RPC channel to the runner is not connected.
    #[error("runner disconnected")]
    Disconnected,

    /// The runner sent something that is not part of the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Runtime is not in a state that accepts the operation.
    #[error("runtime is {state}, expected {expected}")]
    InvalidState { state: String, expected: String },

    /// The retry budget for an operation ran out.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A file the configuration points at does not exist.
    #[error("missing file {path}: {reason}")]
    MissingFile { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for failures of the RPC transport, which the runtime
    /// retries instead of surfacing immediately.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Protocol(_) | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Returns true if this is an unknown-bundle error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BundleNotFound(_))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}
