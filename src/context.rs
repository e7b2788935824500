//! Process-wide orchestrator context.
//!
//! Built once at startup and shared by `Arc` with the HTTP handlers and the
//! CLI; there is no global instance.

use std::sync::Arc;

use tracing::{info, warn};

use crate::buildah::{BuildahCli, SystemBuildah};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::manager::Manager;
use crate::runtime::{ContainerRuntimeFactory, RuntimeFactory};

#[derive(Debug)]
pub struct Orchestrator {
    manager: Manager,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Validates `config` and wires a manager to the system buildah.
    pub fn start(config: OrchestratorConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let cli: Arc<dyn BuildahCli> = Arc::new(SystemBuildah::new(&config.buildah_path));
        let factory = Arc::new(ContainerRuntimeFactory::new(cli, config.runtime.clone()));
        info!(buildah = %config.buildah_path.display(), "Orchestrator started");
        Ok(Self::with_factory(config, factory))
    }

    /// Uses a caller-supplied runtime factory.
    pub fn with_factory(config: OrchestratorConfig, factory: Arc<dyn RuntimeFactory>) -> Arc<Self> {
        Arc::new(Self {
            manager: Manager::new(factory),
            config,
        })
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Waits (up to the shutdown grace period) for queued jobs, then tears
    /// every bundle down.
    pub async fn stop(&self) {
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, self.manager.join()).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Queues did not drain before shutdown");
        }
        self.manager.shutdown().await;
        info!("Orchestrator stopped");
    }
}
