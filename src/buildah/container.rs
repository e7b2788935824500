//! Working containers.
//!
//! A [`Container`] wraps a buildah working container. Its configuration is a
//! plain public field; changes are pushed to buildah lazily, as a single
//! `buildah config` call, right before any operation that observes them
//! (`inspect`, `commit`, `run`, `popen`).
//!
//! # Lifecycle
//!
//! ```text
//!   from_image ──► mutate `config` ──► commit_config ──► run / popen
//!        │                                                  │
//!        └──────────────► mount / copy_in / copy_out ◄──────┘
//!                                   │
//!                                remove (idempotent)
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::config::{ConfigDirective, ContainerConfig, directive_args};
use super::image::Image;
use super::{BuildahCli, ProcessExit, SpawnedProcess, args};
use crate::error::{Error, Result};

/// Flags for `buildah run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// `--user user[:group]`
    pub user: Option<String>,
    /// `--volume host:ctr[:opts]`
    pub volumes: Vec<String>,
    /// `--mount k=v,...`, one map per mount.
    pub mounts: Vec<BTreeMap<String, String>>,
    /// `--terminal`
    pub terminal: bool,
    /// Bytes written to the command's stdin (`run` only).
    pub input: Option<Vec<u8>>,
}

impl RunOptions {
    fn to_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(user) = &self.user {
            out.push("--user".to_string());
            out.push(user.clone());
        }
        for vol in &self.volumes {
            out.push("--volume".to_string());
            out.push(vol.clone());
        }
        for mount in &self.mounts {
            out.push("--mount".to_string());
            out.push(
                mount
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        if self.terminal {
            out.push("--terminal".to_string());
        }
        out
    }
}

/// A buildah working container.
///
/// A container dropped before [`remove`](Container::remove) succeeded is
/// removed in the background.
pub struct Container {
    id: String,
    cli: Arc<dyn BuildahCli>,
    /// Pending configuration; committed lazily.
    pub config: ContainerConfig,
    snapshot: ContainerConfig,
    removed: bool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("removed", &self.removed)
            .finish()
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

impl Container {
    /// Creates a working container from `image`, pulling it if needed.
    ///
    /// `mounts` are `host:ctr[:opts]` volume specs applied to every `run`.
    /// The container's configuration is loaded from buildah; if that fails
    /// the new container is removed before the error is returned.
    pub async fn from_image(
        cli: Arc<dyn BuildahCli>,
        image: &str,
        mounts: &[String],
    ) -> Result<Self> {
        let image = Image::resolve(&cli, image).await?;

        let mut cmd = args(["from"]);
        for mount in mounts {
            cmd.push("--volume".to_string());
            cmd.push(mount.clone());
        }
        cmd.push(image.id().to_string());
        let out = cli.exec(cmd, None).await?;

        let id = out.stdout.trim().to_string();
        if id.is_empty() {
            return Err(Error::InvalidMetadata {
                id: image.id().to_string(),
                reason: "buildah from printed no container id".to_string(),
            });
        }
        info!(container = %id, image = %image, "Created working container");

        let mut container = Self {
            id,
            cli,
            config: ContainerConfig::default(),
            snapshot: ContainerConfig::default(),
            removed: false,
        };
        if let Err(e) = container.load_config().await {
            container.remove().await;
            return Err(e);
        }
        Ok(container)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    async fn load_config(&mut self) -> Result<()> {
        let info = self.inspect_raw().await?;
        self.config = ContainerConfig::from_inspect(&self.id, &info)?;
        self.snapshot = self.config.clone();
        Ok(())
    }

    async fn inspect_raw(&self) -> Result<Value> {
        let out = self
            .cli
            .exec(
                args(["inspect", "--type", "container", self.id.as_str()]),
                None,
            )
            .await?;
        serde_json::from_str(&out.stdout).map_err(|e| Error::InvalidMetadata {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Changes not yet pushed to buildah.
    pub fn pending_changes(&self) -> Vec<ConfigDirective> {
        self.config.diff(&self.snapshot)
    }

    /// Pushes pending configuration changes. Returns false when there was
    /// nothing to push.
    pub async fn commit_config(&mut self) -> Result<bool> {
        let changes = self.pending_changes();
        if changes.is_empty() {
            return Ok(false);
        }
        let mut cmd = args(["config"]);
        cmd.extend(directive_args(&changes));
        cmd.push(self.id.clone());
        self.cli.exec(cmd, None).await?;

        debug!(container = %self.id, changes = changes.len(), "Committed container config");
        self.snapshot = self.config.clone();
        Ok(true)
    }

    /// Commits pending configuration, then returns buildah's metadata.
    pub async fn inspect(&mut self) -> Result<Value> {
        self.commit_config().await?;
        self.inspect_raw().await
    }

    /// Commits the container to a new image.
    pub async fn commit(&mut self) -> Result<Image> {
        self.commit_config().await?;
        let out = self
            .cli
            .exec(args(["commit", self.id.as_str()]), None)
            .await?;
        let image_id = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| Error::InvalidMetadata {
                id: self.id.clone(),
                reason: "buildah commit printed no image id".to_string(),
            })?
            .to_string();
        info!(container = %self.id, image = %image_id, "Committed container");
        Ok(Image::from_id(self.cli.clone(), image_id))
    }

    // =========================================================================
    // Filesystem
    // =========================================================================

    /// Mounts the container's root filesystem on the host.
    pub async fn mount(&self) -> Result<MountGuard> {
        let out = self
            .cli
            .exec(args(["mount", self.id.as_str()]), None)
            .await?;
        let path = PathBuf::from(out.stdout.trim());
        debug!(container = %self.id, path = %path.display(), "Mounted container");
        Ok(MountGuard {
            cli: self.cli.clone(),
            id: self.id.clone(),
            path,
            released: false,
        })
    }

    /// Copies a host file or directory into the container. `dst` is the
    /// full destination name, not its parent directory.
    pub async fn copy_in(&self, src: &Path, dst: &str) -> Result<()> {
        self.cli
            .exec(
                vec![
                    "copy".to_string(),
                    self.id.clone(),
                    src.to_string_lossy().into_owned(),
                    dst.to_string(),
                ],
                None,
            )
            .await?;
        Ok(())
    }

    /// Copies a file or directory out of the container. Whatever already
    /// exists at `dst` is removed first.
    pub async fn copy_out(&self, src: &str, dst: &Path) -> Result<()> {
        match tokio::fs::symlink_metadata(dst).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(dst).await?,
            Ok(_) => tokio::fs::remove_file(dst).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let guard = self.mount().await?;
        let from = guard.path().join(src.trim_start_matches('/'));
        let to = dst.to_path_buf();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| Error::Internal(format!("copy task failed: {e}")));
        guard.unmount().await?;
        copied??;
        Ok(())
    }

    // =========================================================================
    // Processes
    // =========================================================================

    fn run_args(&self, cmd: &[String], opts: &RunOptions) -> Vec<String> {
        let mut out = args(["run"]);
        out.extend(opts.to_args());
        out.push("--".to_string());
        out.push(self.id.clone());
        out.extend(cmd.iter().cloned());
        out
    }

    /// Runs a command to completion and returns its stdout.
    ///
    /// # Errors
    ///
    /// [`Error::CommandFailed`] with exit code, stdout and stderr if the
    /// command exits non-zero.
    pub async fn run(&mut self, cmd: &[String], opts: RunOptions) -> Result<String> {
        self.commit_config().await?;
        let argv = self.run_args(cmd, &opts);
        let out = self.cli.exec(argv, opts.input).await?;
        Ok(out.stdout)
    }

    /// Starts a long-lived command with stdin/stdout piped.
    pub async fn popen(&mut self, cmd: &[String], opts: &RunOptions) -> Result<SpawnedProcess> {
        self.commit_config().await?;
        let argv = self.run_args(cmd, opts);
        self.cli.spawn(argv)
    }

    /// Starts a long-lived command and hands its stdin/stdout to `factory`.
    ///
    /// Returns the process exit future alongside whatever `factory` built.
    pub async fn popen_with_protocol<P, F>(
        &mut self,
        factory: F,
        cmd: &[String],
        opts: &RunOptions,
    ) -> Result<(ProcessExit, P)>
    where
        F: FnOnce(Box<dyn AsyncWrite + Send + Unpin>, Box<dyn AsyncRead + Send + Unpin>) -> P,
    {
        let process = self.popen(cmd, opts).await?;
        let protocol = factory(process.stdin, process.stdout);
        Ok((process.exit, protocol))
    }

    /// Removes the working container. Failures are logged; calling this
    /// again after success is a no-op.
    pub async fn remove(&mut self) {
        if self.removed {
            return;
        }
        match self
            .cli
            .exec(args(["rm", self.id.as_str()]), None)
            .await
        {
            Ok(_) => {
                self.removed = true;
                info!(container = %self.id, "Removed container");
            }
            Err(e) => warn!(container = %self.id, error = %e, "Failed to remove container"),
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if !self.removed {
            spawn_cleanup(self.cli.clone(), "rm", std::mem::take(&mut self.id));
        }
    }
}

// =============================================================================
// Mount Guard
// =============================================================================

/// A mounted container filesystem.
///
/// Call [`MountGuard::unmount`] to release it. A guard dropped without
/// release (early return, cancellation) schedules a best-effort unmount on
/// the current tokio runtime.
pub struct MountGuard {
    cli: Arc<dyn BuildahCli>,
    id: String,
    path: PathBuf,
    released: bool,
}

impl std::fmt::Debug for MountGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountGuard")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl MountGuard {
    /// Host path of the container's root filesystem.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn unmount(mut self) -> Result<()> {
        self.released = true;
        self.cli
            .exec(args(["umount", self.id.as_str()]), None)
            .await?;
        debug!(container = %self.id, "Unmounted container");
        Ok(())
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if !self.released {
            spawn_cleanup(self.cli.clone(), "umount", std::mem::take(&mut self.id));
        }
    }
}

/// Runs `buildah <verb> <id>` on the current tokio runtime without waiting
/// for it. Used from `Drop`, where nothing can be awaited.
fn spawn_cleanup(cli: Arc<dyn BuildahCli>, verb: &'static str, id: String) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            debug!(container = %id, command = verb, "Scheduling background cleanup");
            handle.spawn(async move {
                if let Err(e) = cli.exec(args([verb, id.as_str()]), None).await {
                    warn!(container = %id, command = verb, error = %e, "Background cleanup failed");
                }
            });
        }
        Err(_) => warn!(container = %id, command = verb, "Dropped outside a tokio runtime, not cleaned up"),
    }
}

/// Recursively copies a file, symlink or directory tree.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
            return Ok(());
        }
        #[cfg(not(unix))]
        {
            fs::copy(src, dst)?;
            return Ok(());
        }
    }
    if meta.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        fs::set_permissions(dst, meta.permissions())?;
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}
