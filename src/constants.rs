//! # Orchestrator Constants
//!
//! Defaults, limits and timeouts shared by the container engine, the runtime
//! and the manager. Configuration values in [`crate::config`] fall back to
//! these when unset.
//!
//! ## Cross-References
//!
//! - [`crate::bundle`]: archive size and entry limits
//! - [`crate::runtime`]: readiness and call timeouts, backoff defaults
//! - [`crate::rpc`]: frame size limit
//! - [`crate::manager`]: bundle name validation

use std::time::Duration;

// =============================================================================
// Container Defaults
// =============================================================================

/// Program name of the external container CLI.
pub const DEFAULT_BUILDAH: &str = "buildah";

/// Image every bundle container is created from.
pub const DEFAULT_BASE_IMAGE: &str = "python:3";

/// Directory inside the container the bundle archive is extracted into.
/// Also becomes the container's working directory.
pub const DEFAULT_APP_DIR: &str = "/app";

/// Location inside the container the runner entrypoint is copied to.
pub const DEFAULT_RUNNER_PATH: &str = "/__runner__";

/// Interpreter that runs the bundled Python runner inside the container.
pub const DEFAULT_RUNNER_INTERPRETER: &str = "python3";

/// Container label carrying the bundle name.
pub const BUNDLE_LABEL: &str = "io.microfaas.bundle";

/// Container label carrying the bundle archive digest.
pub const DIGEST_LABEL: &str = "io.microfaas.digest";

/// Environment variable set by `buildah unshare` inside the user namespace.
pub const USERNS_CONFIGURED_ENV: &str = "_CONTAINERS_USERNS_CONFIGURED";

// =============================================================================
// Bundle Limits
// =============================================================================

/// Maximum size of an uploaded bundle archive (256 MiB).
///
/// **Rationale**: Bundles are code, not data. Anything larger belongs in a
/// volume.
pub const MAX_BUNDLE_SIZE: u64 = 256 * 1024 * 1024;

/// Maximum total uncompressed size of a bundle (1 GiB).
///
/// **Attack Vector**: Zip bombs (small compressed, huge uncompressed).
pub const MAX_EXTRACTED_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum number of entries in a bundle archive.
pub const MAX_BUNDLE_ENTRIES: usize = 100_000;

/// Maximum bundle name length.
///
/// **Rationale**: Names end up in container labels and log lines; 63 matches
/// DNS label length so names can be reused as hostnames.
pub const MAX_BUNDLE_NAME_LEN: usize = 63;

/// Characters permitted in bundle names.
pub const BUNDLE_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

// =============================================================================
// Timeouts
// =============================================================================

/// How long bootstrap waits for the runner's readiness message.
///
/// **Rationale**: `buildah run` has to set up namespaces and the runner has
/// to start; a few seconds is typical, 60s covers a cold page cache.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a single RPC round-trip (5 minutes).
///
/// A call exceeding this is treated as a transport failure and retried.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period `Orchestrator::stop` waits for queues to drain before tearing
/// everything down.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// =============================================================================
// Backoff
// =============================================================================

/// First delay after a failed call or a runner exit.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Ceiling for the exponential backoff delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Attempts before a call, or the first runner launch, is given up on.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// How long a runner must stay up before its exit starts the respawn
/// backoff over from the initial delay.
pub const RUNNER_MIN_UPTIME: Duration = Duration::from_secs(10);

// =============================================================================
// RPC Limits
// =============================================================================

/// Maximum length of one protocol line (16 MiB).
///
/// **Attack Vector**: A misbehaving runner writing an endless line would
/// otherwise grow the read buffer without bound.
pub const MAX_RPC_LINE_LEN: usize = 16 * 1024 * 1024;

/// Version string the runner reports in its readiness message.
pub const RUNNER_PROTOCOL_VERSION: &str = "1";

/// How long shutdown waits to close a runner's stdin.
pub const RUNNER_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

// =============================================================================
// Server Defaults
// =============================================================================

/// Default control-plane listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8900";

// =============================================================================
// Bundle Name Validation Helper
// =============================================================================

/// Validates a bundle name.
///
/// Names must be non-empty, at most [`MAX_BUNDLE_NAME_LEN`] bytes, drawn from
/// [`BUNDLE_NAME_VALID_CHARS`], and must not start or end with a hyphen.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before the name is used"]
pub fn validate_bundle_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("bundle name cannot be empty");
    }
    if name.len() > MAX_BUNDLE_NAME_LEN {
        return Err("bundle name exceeds maximum length");
    }
    if !name.chars().all(|c| BUNDLE_NAME_VALID_CHARS.contains(c)) {
        return Err("bundle name contains invalid characters");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("bundle name cannot start or end with hyphen");
    }
    Ok(())
}
