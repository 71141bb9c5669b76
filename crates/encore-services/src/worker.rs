//! Worker server — receives envelopes, executes or serves them from cache,
//! and delivers the result to the originating client.
//!
//! `submit` stamps t1 and places the envelope on a bounded inbound lane. The
//! run loop takes one execution permit per envelope and runs it on the
//! blocking pool: stamp t2, consult the cache, fall back to the engine, stamp
//! t3, deliver. A failed delivery is logged and counted, never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Semaphore};

use encore_core::config::WorkerSettings;
use encore_core::{LifecycleError, QueryEnvelope, QueryId, Stage, WorkerId};

use crate::cache::{CacheStats, ResultCache};
use crate::dataset::QueryEngine;
use crate::directory::Directory;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("worker {worker} queue full, query {query} rejected")]
    Overloaded { worker: WorkerId, query: QueryId },
    #[error("worker {0} is not running")]
    WorkerGone(WorkerId),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Default)]
pub struct WorkerCounters {
    received: AtomicU64,
    executed: AtomicU64,
    cache_hits: AtomicU64,
    delivery_failures: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker: WorkerId,
    pub received: u64,
    pub executed: u64,
    pub cache_hits: u64,
    pub delivery_failures: u64,
    /// Envelopes discarded on a lifecycle violation.
    pub dropped: u64,
    pub cache: CacheStats,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Submission side of a worker. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::Sender<QueryEnvelope>,
    counters: Arc<WorkerCounters>,
    cache: Arc<ResultCache>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Stamp t1 and enqueue. Fire-and-forget: the result arrives by delivery.
    pub fn submit(&self, mut envelope: QueryEnvelope) -> Result<(), SubmitError> {
        envelope.stamp(Stage::Enqueued)?;
        let query = envelope.id.clone();
        self.tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Overloaded {
                worker: self.id.clone(),
                query,
            },
            TrySendError::Closed(_) => SubmitError::WorkerGone(self.id.clone()),
        })?;
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            worker: self.id.clone(),
            received: c.received.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }
}

// ── Execution ─────────────────────────────────────────────────────────────────

struct Executor {
    id: WorkerId,
    engine: Arc<dyn QueryEngine>,
    cache: Arc<ResultCache>,
    directory: Directory,
    counters: Arc<WorkerCounters>,
}

impl Executor {
    fn process(&self, mut envelope: QueryEnvelope) {
        if let Err(e) = envelope.stamp(Stage::Executing) {
            self.drop_envelope(&envelope, e);
            return;
        }

        let (result, from_cache) = match self.cache.lookup(&envelope.query) {
            Some(result) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                (result, true)
            }
            None => {
                let execution = self.engine.execute(&envelope.query);
                if let Some(fragment) = execution.fragment {
                    self.cache.store(fragment);
                }
                (execution.result, false)
            }
        };
        self.counters.executed.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = envelope.complete(self.id.clone(), result, from_cache) {
            self.drop_envelope(&envelope, e);
            return;
        }

        tracing::debug!(
            worker = %self.id,
            query = envelope.id.short(),
            client = %envelope.client,
            from_cache,
            "query executed"
        );

        if let Err(e) = self.directory.deliver(envelope) {
            self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(worker = %self.id, error = %e, "delivery failed");
        }
    }

    fn drop_envelope(&self, envelope: &QueryEnvelope, error: LifecycleError) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            worker = %self.id,
            query = envelope.id.short(),
            error = %error,
            "lifecycle violation, envelope dropped"
        );
    }
}

pub struct Worker {
    executor: Arc<Executor>,
    lanes: usize,
    rx: mpsc::Receiver<QueryEnvelope>,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        engine: Arc<dyn QueryEngine>,
        settings: &WorkerSettings,
        directory: Directory,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, WorkerHandle) {
        let lanes = if settings.execution_lanes == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            settings.execution_lanes as usize
        };
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let counters = Arc::new(WorkerCounters::default());
        let cache = Arc::new(ResultCache::new(
            settings.max_users,
            settings.max_categories_per_user,
        ));

        let handle = WorkerHandle {
            id: id.clone(),
            tx,
            counters: counters.clone(),
            cache: cache.clone(),
        };
        let worker = Self {
            executor: Arc::new(Executor {
                id,
                engine,
                cache,
                directory,
                counters,
            }),
            lanes,
            rx,
            shutdown,
        };
        (worker, handle)
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.lanes));
        tracing::info!(worker = %self.executor.id, lanes = self.lanes, "worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(worker = %self.executor.id, "worker shutting down");
                    return Ok(());
                }

                msg = self.rx.recv() => {
                    let Some(envelope) = msg else {
                        tracing::info!(worker = %self.executor.id, "all handles dropped, worker exiting");
                        return Ok(());
                    };

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return Ok(()), // semaphore closed
                    };

                    let executor = self.executor.clone();
                    tokio::task::spawn_blocking(move || {
                        executor.process(envelope);
                        drop(permit);
                    });
                }
            }
        }
    }
}
