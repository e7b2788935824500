//! Bundle manager.
//!
//! The [`Manager`] owns every deployed bundle. A bundle is a name, a
//! [`JobQueue`], one consumer task draining that queue, and the
//! [`FunctionRuntime`] the consumer currently sends jobs to.
//!
//! # Redeploys
//!
//! Deploying over an existing name bootstraps a *new* runtime first, then
//! swaps it into the bundle under the registry lock. The queue and consumer
//! are untouched, so jobs queued before the redeploy are delivered to the
//! new runtime. The old runtime is shut down after the swap; shutdown waits
//! for a call already in flight on it. If bootstrap fails, nothing is
//! swapped and the old runtime keeps serving.
//!
//! # Registry
//!
//! The registry holds the only long-lived strong reference to each
//! bundle's shared state. Consumers hold a weak one and look the runtime up
//! per job, so a mid-flight redeploy is observed and a deleted bundle's
//! consumer winds down by itself. `delete(join = true)` keeps a strong
//! reference while the queue drains.
//!
//! The registry lock is a `std::sync::RwLock` and is never held across an
//! await.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bundle::{BundleArchive, BundleSource};
use crate::constants::validate_bundle_name;
use crate::error::{Error, Result};
use crate::queue::{Job, JobQueue};
use crate::runtime::{FunctionRuntime, RuntimeFactory, RuntimeState};

/// Snapshot of one bundle, as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleInfo {
    pub name: String,
    /// Incremented by every successful redeploy; starts at 1.
    pub revision: u64,
    pub digest: String,
    pub deployed_at: DateTime<Utc>,
    pub state: RuntimeState,
    pub runtime_id: String,
    /// Jobs waiting to be picked up.
    pub queued: usize,
    /// Jobs queued or in flight.
    pub unfinished: usize,
}

#[derive(Debug, Clone)]
struct Revision {
    number: u64,
    digest: String,
    deployed_at: DateTime<Utc>,
}

/// State shared between the registry and a bundle's consumer.
struct Bundle {
    name: String,
    queue: Arc<JobQueue>,
    current: RwLock<(Arc<dyn FunctionRuntime>, Revision)>,
}

impl Bundle {
    fn runtime(&self) -> Arc<dyn FunctionRuntime> {
        match self.current.read() {
            Ok(current) => current.0.clone(),
            Err(poisoned) => poisoned.into_inner().0.clone(),
        }
    }

    /// Installs `runtime` and returns the one it replaces.
    fn swap(
        &self,
        runtime: Arc<dyn FunctionRuntime>,
        digest: String,
    ) -> (Arc<dyn FunctionRuntime>, u64) {
        let mut current = match self.current.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        let number = current.1.number + 1;
        let revision = Revision {
            number,
            digest,
            deployed_at: Utc::now(),
        };
        let (old, _) = std::mem::replace(&mut *current, (runtime, revision));
        (old, number)
    }

    fn info(&self) -> BundleInfo {
        let (runtime, revision) = match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        BundleInfo {
            name: self.name.clone(),
            revision: revision.number,
            digest: revision.digest,
            deployed_at: revision.deployed_at,
            state: runtime.state(),
            runtime_id: runtime.id().to_string(),
            queued: self.queue.len(),
            unfinished: self.queue.unfinished(),
        }
    }
}

struct BundleEntry {
    shared: Arc<Bundle>,
    consumer: JoinHandle<()>,
}

/// Owns the set of deployed bundles.
pub struct Manager {
    factory: Arc<dyn RuntimeFactory>,
    bundles: RwLock<HashMap<String, BundleEntry>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("bundles", &self.names())
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new(factory: Arc<dyn RuntimeFactory>) -> Self {
        Self {
            factory,
            bundles: RwLock::new(HashMap::new()),
        }
    }

    /// Creates or replaces a bundle. Returns once its runtime is ready.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBundleName`] before any container work; otherwise
    /// whatever loading the archive or bootstrapping the runtime failed
    /// with. A failed redeploy leaves the previous runtime in place.
    pub async fn deploy(&self, name: &str, source: BundleSource) -> Result<BundleInfo> {
        validate_bundle_name(name).map_err(|reason| Error::InvalidBundleName {
            name: name.to_string(),
            reason: reason.to_string(),
        })?;

        let archive = BundleArchive::load(&source).await?;
        info!(bundle = %name, digest = %archive.digest(), "Deploying bundle");
        let runtime = self.factory.launch(name, &archive).await?;
        let digest = archive.digest().to_string();

        let (replaced, info) = {
            let mut bundles = self
                .bundles
                .write()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            match bundles.get(name) {
                Some(entry) => {
                    let (old, revision) = entry.shared.swap(runtime, digest);
                    debug!(bundle = %name, revision, "Swapped in new runtime");
                    (Some(old), entry.shared.info())
                }
                None => {
                    let shared = Arc::new(Bundle {
                        name: name.to_string(),
                        queue: Arc::new(JobQueue::new()),
                        current: RwLock::new((
                            runtime,
                            Revision {
                                number: 1,
                                digest,
                                deployed_at: Utc::now(),
                            },
                        )),
                    });
                    let consumer = tokio::spawn(consume(
                        name.to_string(),
                        shared.queue.clone(),
                        Arc::downgrade(&shared),
                    ));
                    let info = shared.info();
                    bundles.insert(name.to_string(), BundleEntry { shared, consumer });
                    (None, info)
                }
            }
        };

        if let Some(old) = replaced {
            old.shutdown().await;
        }
        info!(bundle = %name, revision = info.revision, "Bundle deployed");
        Ok(info)
    }

    /// Queues a call. Does not wait for it to run.
    pub fn call(
        &self,
        name: &str,
        function: &str,
        body: Value,
        extras: Map<String, Value>,
    ) -> Result<()> {
        let bundles = self
            .bundles
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        let entry = bundles
            .get(name)
            .ok_or_else(|| Error::BundleNotFound(name.to_string()))?;
        entry.shared.queue.put(Job {
            function: function.to_string(),
            body,
            extras,
        });
        debug!(bundle = %name, function, "Queued call");
        Ok(())
    }

    /// Waits until every registered bundle's queue is drained.
    pub async fn join(&self) {
        let queues: Vec<Arc<JobQueue>> = match self.bundles.read() {
            Ok(bundles) => bundles.values().map(|e| e.shared.queue.clone()).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .values()
                .map(|e| e.shared.queue.clone())
                .collect(),
        };
        join_all(queues.iter().map(|q| q.join())).await;
    }

    /// Removes a bundle. With `join`, queued jobs are processed first;
    /// otherwise they are discarded. Either way, callers blocked in
    /// [`join`](Self::join) are released once the bundle is gone.
    pub async fn delete(&self, name: &str, join: bool) -> Result<()> {
        let entry = self
            .bundles
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?
            .remove(name)
            .ok_or_else(|| Error::BundleNotFound(name.to_string()))?;
        let BundleEntry { shared, consumer } = entry;

        if join {
            debug!(bundle = %name, pending = shared.queue.unfinished(), "Draining queue");
            shared.queue.join().await;
        }

        stop_consumer(name, consumer).await;
        let dropped = shared.queue.close();
        if dropped > 0 {
            warn!(bundle = %name, dropped, "Discarded queued jobs");
        }
        let runtime = shared.runtime();
        drop(shared);
        runtime.shutdown().await;
        info!(bundle = %name, "Bundle deleted");
        Ok(())
    }

    /// Names of operating bundles, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.bundles.read() {
            Ok(bundles) => bundles.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        names.sort();
        names
    }

    pub fn bundle_info(&self, name: &str) -> Result<BundleInfo> {
        let bundles = self
            .bundles
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        bundles
            .get(name)
            .map(|entry| entry.shared.info())
            .ok_or_else(|| Error::BundleNotFound(name.to_string()))
    }

    /// Info for every bundle, sorted by name.
    pub fn list(&self) -> Vec<BundleInfo> {
        let mut infos: Vec<BundleInfo> = match self.bundles.read() {
            Ok(bundles) => bundles.values().map(|e| e.shared.info()).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .values()
                .map(|e| e.shared.info())
                .collect(),
        };
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Tears everything down. Consumers are stopped and their queues closed
    /// first, then every runtime is shut down concurrently; one failure
    /// never blocks another.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, BundleEntry)> = match self.bundles.write() {
            Ok(mut bundles) => bundles.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };
        if entries.is_empty() {
            return;
        }
        info!(bundles = entries.len(), "Shutting down all bundles");

        let mut runtimes = Vec::with_capacity(entries.len());
        let mut consumers = Vec::with_capacity(entries.len());
        let mut queues = Vec::with_capacity(entries.len());
        for (name, BundleEntry { shared, consumer }) in entries {
            runtimes.push((name.clone(), shared.runtime()));
            queues.push(shared.queue.clone());
            consumers.push((name, consumer));
        }

        join_all(
            consumers
                .into_iter()
                .map(|(name, consumer)| async move { stop_consumer(&name, consumer).await }),
        )
        .await;
        for queue in queues {
            queue.close();
        }
        join_all(runtimes.into_iter().map(|(name, runtime)| async move {
            runtime.shutdown().await;
            debug!(bundle = %name, "Runtime shut down");
        }))
        .await;
    }
}

/// Aborts a consumer and waits for it; cancellation is expected.
async fn stop_consumer(name: &str, consumer: JoinHandle<()>) {
    consumer.abort();
    match consumer.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(bundle = %name, error = %e, "Consumer task panicked"),
    }
}

/// Consumer loop: one job at a time, always on the bundle's current runtime.
///
/// A call that fails because a redeploy stopped its runtime underneath it
/// is sent again to the replacement.
async fn consume(name: String, queue: Arc<JobQueue>, bundle: Weak<Bundle>) {
    loop {
        let job = queue.get().await;
        let Some(mut runtime) = current_runtime(&bundle) else {
            debug!(bundle = %name, "Bundle gone, consumer exiting");
            return;
        };

        loop {
            match runtime.call(&job.function, &job.body, &job.extras).await {
                Ok(outcome) => {
                    debug!(
                        bundle = %name,
                        function = %job.function,
                        items = outcome.items.len(),
                        errors = outcome.errors.len(),
                        "Job processed"
                    );
                    break;
                }
                Err(e) => match current_runtime(&bundle) {
                    Some(current) if !Arc::ptr_eq(&current, &runtime) => {
                        warn!(
                            bundle = %name,
                            function = %job.function,
                            error = %e,
                            "Runtime replaced during call, redelivering"
                        );
                        runtime = current;
                    }
                    _ => {
                        error!(bundle = %name, function = %job.function, error = %e, "Job failed");
                        break;
                    }
                },
            }
        }
        queue.task_done();
    }
}

fn current_runtime(bundle: &Weak<Bundle>) -> Option<Arc<dyn FunctionRuntime>> {
    bundle.upgrade().map(|b| b.runtime())
}
