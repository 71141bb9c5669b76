//! Topology — starts the proxy and every configured worker in-process and
//! binds them in a shared directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use encore_core::config::{ClientSettings, EncoreConfig, WorkerConfig};
use encore_core::{ClientId, WorkerId};

use crate::client::{Client, ClientInbox};
use crate::dataset::{Dataset, DatasetError, QueryEngine};
use crate::directory::Directory;
use crate::proxy::{AssignmentProxy, ProxyHandle};
use crate::worker::{Worker, WorkerHandle, WorkerStats};

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("worker {worker} refused to start: {source}")]
    DatasetUnavailable {
        worker: String,
        #[source]
        source: DatasetError,
    },
}

pub struct Topology {
    proxy: ProxyHandle,
    directory: Directory,
    workers: Vec<WorkerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Topology {
    /// Load each worker's dataset (once per distinct path) and start.
    pub fn start(
        config: &EncoreConfig,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Self, TopologyError> {
        Self::start_with(config, shutdown, shared_loader(config, Dataset::load))
    }

    /// Start with a caller-chosen engine per worker.
    pub fn start_with<F>(
        config: &EncoreConfig,
        shutdown: &broadcast::Sender<()>,
        mut engine_for: F,
    ) -> Result<Self, TopologyError>
    where
        F: FnMut(&WorkerConfig) -> Result<Arc<dyn QueryEngine>, DatasetError>,
    {
        // resolve every engine before spawning anything
        let mut engines = Vec::new();
        for zone in &config.topology.zones {
            for w in &zone.workers {
                let engine = engine_for(w).map_err(|source| TopologyError::DatasetUnavailable {
                    worker: w.name.clone(),
                    source,
                })?;
                engines.push((w, engine));
            }
        }

        let directory = Directory::new();
        let mut workers = Vec::new();
        let mut tasks = Vec::new();
        for (w, engine) in engines {
            let (worker, handle) = Worker::new(
                WorkerId::new(w.name.clone()),
                engine,
                &config.worker,
                directory.clone(),
                shutdown.subscribe(),
            );
            directory.bind_worker(format!("{}:{}", w.address, w.port), handle.clone());
            let name = w.name.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    tracing::error!(worker = %name, error = %e, "worker failed");
                }
            }));
            workers.push(handle);
        }

        let (proxy, proxy_task) = ProxyHandle::spawn(
            AssignmentProxy::from_topology(&config.topology),
            shutdown.subscribe(),
        );
        tasks.push(proxy_task);

        tracing::info!(
            zones = config.topology.zones.len(),
            workers = workers.len(),
            "topology started"
        );
        Ok(Self {
            proxy,
            directory,
            workers,
            tasks,
        })
    }

    pub fn proxy(&self) -> &ProxyHandle {
        &self.proxy
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn client(&self, id: ClientId, settings: &ClientSettings) -> (Client, ClientInbox) {
        Client::new(id, self.proxy.clone(), self.directory.clone(), settings)
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.stats()).collect()
    }

    /// Wait for every task to stop after shutdown was signalled.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Engine factory that runs `load` once per distinct dataset path and hands
/// every worker on that path the same dataset.
fn shared_loader<'a, L>(
    config: &'a EncoreConfig,
    mut load: L,
) -> impl FnMut(&WorkerConfig) -> Result<Arc<dyn QueryEngine>, DatasetError> + 'a
where
    L: FnMut(&Path) -> Result<Dataset, DatasetError> + 'a,
{
    let mut loaded: HashMap<PathBuf, Arc<Dataset>> = HashMap::new();
    move |w| {
        let path = w.dataset.clone().unwrap_or_else(|| config.dataset.path.clone());
        if let Some(ds) = loaded.get(&path) {
            return Ok(ds.clone() as Arc<dyn QueryEngine>);
        }
        let ds = Arc::new(load(&path)?);
        loaded.insert(path, ds.clone());
        Ok(ds as Arc<dyn QueryEngine>)
    }
}
