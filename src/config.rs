//! Orchestrator configuration.
//!
//! Loaded with `figment` from an optional YAML file, overridden by
//! `MICROFAAS_`-prefixed environment variables (nested keys separated by
//! `__`, e.g. `MICROFAAS_RUNTIME__BASE_IMAGE=python:3.12`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_APP_DIR, DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_BASE_IMAGE,
    DEFAULT_BUILDAH, DEFAULT_CALL_TIMEOUT, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_READY_TIMEOUT, DEFAULT_RUNNER_INTERPRETER, DEFAULT_RUNNER_PATH, DEFAULT_SHUTDOWN_GRACE,
};
use crate::error::{Error, Result};

/// Top-level configuration for the orchestrator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Control-plane listen address.
    pub listen_addr: String,
    /// Path or program name of the buildah CLI.
    pub buildah_path: PathBuf,
    /// Emit JSON log lines instead of compact text.
    pub structured_logging: bool,
    /// Seconds `stop()` waits for queues to drain.
    pub shutdown_grace_secs: u64,
    /// Per-bundle runtime settings.
    pub runtime: RuntimeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            buildah_path: PathBuf::from(DEFAULT_BUILDAH),
            structured_logging: false,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(OrchestratorConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::MissingFile {
                    path: path.to_path_buf(),
                    reason: "configuration file not found".to_string(),
                });
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: OrchestratorConfig = figment
            .merge(Env::prefixed("MICROFAAS_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a YAML string (no environment overrides).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: OrchestratorConfig =
            Figment::from(Serialized::defaults(OrchestratorConfig::default()))
                .merge(Yaml::string(yaml))
                .extract()
                .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(Error::Config(format!(
                "invalid listen address: {}",
                self.listen_addr
            )));
        }
        self.runtime.validate()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Settings applied to every bundle runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Image each bundle container is created from.
    pub base_image: String,
    /// Directory the bundle is extracted into; becomes the working directory.
    pub app_dir: String,
    /// Command run inside the container to install the runner's
    /// dependencies. Skipped when unset.
    pub install_command: Option<Vec<String>>,
    /// Host path of a custom runner executable. When unset, the bundled
    /// Python runner is copied in and started with `python3`.
    pub runner_binary: Option<PathBuf>,
    /// Where the runner entrypoint is placed inside the container.
    pub runner_path: String,
    /// Command that starts the runner. Defaults to `[runner_path]` for a
    /// custom runner and `["python3", runner_path]` otherwise.
    pub runner_command: Option<Vec<String>>,
    pub ready_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            app_dir: DEFAULT_APP_DIR.to_string(),
            install_command: None,
            runner_binary: None,
            runner_path: DEFAULT_RUNNER_PATH.to_string(),
            runner_command: None,
            ready_timeout_secs: DEFAULT_READY_TIMEOUT.as_secs(),
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.app_dir.starts_with('/') {
            return Err(Error::Config(format!(
                "app_dir must be absolute: {}",
                self.app_dir
            )));
        }
        if !self.runner_path.starts_with('/') {
            return Err(Error::Config(format!(
                "runner_path must be absolute: {}",
                self.runner_path
            )));
        }
        if let Some(cmd) = &self.runner_command {
            if cmd.is_empty() {
                return Err(Error::Config("runner_command cannot be empty".to_string()));
            }
        }
        if let Some(cmd) = &self.install_command {
            if cmd.is_empty() {
                return Err(Error::Config("install_command cannot be empty".to_string()));
            }
        }
        if self.ready_timeout_secs == 0 || self.call_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        self.backoff.validate()
    }

    /// Command line used to start the runner inside the container.
    pub fn runner_command(&self) -> Vec<String> {
        if let Some(cmd) = &self.runner_command {
            return cmd.clone();
        }
        match &self.runner_binary {
            Some(_) => vec![self.runner_path.clone()],
            None => vec![
                DEFAULT_RUNNER_INTERPRETER.to_string(),
                self.runner_path.clone(),
            ],
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Capped exponential backoff, shared by the call retry loop and the
/// supervisor's respawn loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// Attempts per call, and launches allowed before the first runner
    /// becomes ready. A runtime that was ready once respawns indefinitely.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_BACKOFF_INITIAL.as_millis() as u64,
            max_ms: DEFAULT_BACKOFF_MAX.as_millis() as u64,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("backoff.max_attempts must be at least 1".to_string()));
        }
        if self.initial_ms > self.max_ms {
            return Err(Error::Config(format!(
                "backoff.initial_ms ({}) exceeds backoff.max_ms ({})",
                self.initial_ms, self.max_ms
            )));
        }
        Ok(())
    }
}
