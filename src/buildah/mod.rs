//! Container engine built on the `buildah` CLI.
//!
//! Every interaction with buildah goes through the [`BuildahCli`] trait:
//! [`SystemBuildah`] shells out to the real binary, tests substitute a fake
//! that records argument vectors and scripts outputs.
//!
//! # Components
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Container  (container.rs)                                   │
//! │    from_image → mutate fields → commit_config → run/popen    │
//! │    mount guard │ copy_in/out │ commit → Image │ remove       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ContainerConfig  (config.rs)                                │
//! │    snapshot diff → `buildah config` directives               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Image  (image.rs)                                           │
//! │    resolve (local or pull) │ tag │ list │ inspect │ rmi      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  BuildahCli  (this module)                                   │
//! │    exec(args) → stdout  │  spawn(args) → stdin/stdout/exit   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Unprivileged Operation
//!
//! buildah needs a user namespace to mount container filesystems as a
//! regular user. [`in_user_namespace`] reports whether the current process
//! already runs inside one, and [`reexec_in_user_namespace`] replaces the
//! process with `buildah unshare <argv...>` when it does not.

pub mod config;
pub mod container;
pub mod image;

pub use config::{ConfigDirective, ContainerConfig, join_shell_words};
pub use container::{Container, MountGuard, RunOptions};
pub use image::{Image, ImageSummary};

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::constants::{DEFAULT_BUILDAH, USERNS_CONFIGURED_ENV};
use crate::error::{Error, Result};

// =============================================================================
// CLI Seam
// =============================================================================

/// Captured output of a finished CLI invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Resolves to the exit code of a spawned process (`None` if killed by a
/// signal). Dropping it kills the process.
pub type ProcessExit = Pin<Box<dyn Future<Output = io::Result<Option<i32>>> + Send>>;

/// A long-lived CLI subprocess with its standard streams attached.
pub struct SpawnedProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub exit: ProcessExit,
    pub pid: Option<u32>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Interface to the buildah binary.
#[async_trait]
pub trait BuildahCli: Send + Sync {
    /// Runs `buildah <args>` to completion, optionally feeding `input` on
    /// stdin.
    ///
    /// # Errors
    ///
    /// [`Error::CommandFailed`] on a non-zero exit, [`Error::Spawn`] if the
    /// binary cannot be launched.
    async fn exec(&self, args: Vec<String>, input: Option<Vec<u8>>) -> Result<CommandOutput>;

    /// Starts `buildah <args>` with piped stdin/stdout and inherited stderr.
    fn spawn(&self, args: Vec<String>) -> Result<SpawnedProcess>;

    /// Program name used in error messages.
    fn program(&self) -> &str {
        DEFAULT_BUILDAH
    }
}

/// Builds an owned argument vector.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

// =============================================================================
// System Implementation
// =============================================================================

/// Invokes the real `buildah` binary through `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemBuildah {
    program: String,
}

impl SystemBuildah {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_string_lossy().into_owned(),
        }
    }

    fn describe(&self, args: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn spawn_error(&self, source: io::Error) -> Error {
        Error::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

impl Default for SystemBuildah {
    fn default() -> Self {
        Self::new(DEFAULT_BUILDAH)
    }
}

#[async_trait]
impl BuildahCli for SystemBuildah {
    async fn exec(&self, args: Vec<String>, input: Option<Vec<u8>>) -> Result<CommandOutput> {
        debug!(command = %self.describe(&args), "Running buildah");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        // Stdin is fed while output is collected; a child that fills its
        // stdout pipe before reading all of its input must not stall us.
        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: self.describe(&args),
                code: output.status.code(),
                stdout,
                stderr,
            });
        }
        // A command may exit successfully without reading all of its input.
        match fed {
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
        Ok(CommandOutput { stdout, stderr })
    }

    fn spawn(&self, args: Vec<String>) -> Result<SpawnedProcess> {
        debug!(command = %self.describe(&args), "Spawning buildah");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not captured".to_string()))?;
        let pid = child.id();

        // The child moves into the future; dropping it kills the process.
        let exit: ProcessExit = Box::pin(async move {
            let status = child.wait().await?;
            Ok::<_, io::Error>(status.code())
        });

        Ok(SpawnedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit,
            pid,
        })
    }

    fn program(&self) -> &str {
        &self.program
    }
}

// =============================================================================
// User Namespace Trampoline
// =============================================================================

/// Returns true if this process already runs under `buildah unshare`.
pub fn in_user_namespace() -> bool {
    std::env::var_os(USERNS_CONFIGURED_ENV).is_some()
}

/// Replaces the current process with `buildah unshare <argv...>`.
///
/// Only returns if the exec fails.
#[cfg(unix)]
pub fn reexec_in_user_namespace(program: &Path) -> io::Error {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("microfaas"));
    std::process::Command::new(program)
        .arg("unshare")
        .arg(exe)
        .args(std::env::args_os().skip(1))
        .exec()
}
