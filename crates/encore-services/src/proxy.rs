//! Assignment proxy — picks a worker for a zone.
//!
//! Round-robin per zone over the workers loaded from configuration. The only
//! state touched by `assign` is the zone's cursor, so concurrent calls are
//! safe and an invalid zone leaves everything untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use encore_core::config::TopologyConfig;
use encore_core::{ServerAssignment, WorkerId, ZoneId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignmentError {
    #[error("zone {0} is not registered")]
    InvalidZone(ZoneId),
    #[error("zone {0} has no available worker")]
    Unavailable(ZoneId),
    #[error("assignment proxy is not running")]
    ProxyGone,
}

struct ZonePool {
    workers: Vec<ServerAssignment>,
    cursor: AtomicUsize,
}

pub struct AssignmentProxy {
    zones: HashMap<ZoneId, ZonePool>,
}

impl AssignmentProxy {
    pub fn new(zones: impl IntoIterator<Item = (ZoneId, Vec<ServerAssignment>)>) -> Self {
        let zones = zones
            .into_iter()
            .map(|(zone, workers)| {
                (
                    zone,
                    ZonePool {
                        workers,
                        cursor: AtomicUsize::new(0),
                    },
                )
            })
            .collect();
        Self { zones }
    }

    pub fn from_topology(topology: &TopologyConfig) -> Self {
        Self::new(topology.zones.iter().map(|z| {
            let workers = z
                .workers
                .iter()
                .map(|w| ServerAssignment {
                    worker: WorkerId::new(w.name.clone()),
                    address: w.address.clone(),
                    port: w.port,
                })
                .collect();
            (z.zone_id(), workers)
        }))
    }

    pub fn assign(&self, zone: ZoneId) -> Result<ServerAssignment, AssignmentError> {
        let pool = self
            .zones
            .get(&zone)
            .ok_or(AssignmentError::InvalidZone(zone))?;
        if pool.workers.is_empty() {
            return Err(AssignmentError::Unavailable(zone));
        }
        let i = pool.cursor.fetch_add(1, Ordering::Relaxed) % pool.workers.len();
        Ok(pool.workers[i].clone())
    }

    pub fn zones(&self) -> impl Iterator<Item = ZoneId> + '_ {
        self.zones.keys().copied()
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct AssignRequest {
    zone: ZoneId,
    reply: oneshot::Sender<Result<ServerAssignment, AssignmentError>>,
}

/// Cloneable handle to a running proxy task.
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<AssignRequest>,
}

impl ProxyHandle {
    /// Spawn the proxy task. It exits on shutdown or when every handle is dropped.
    pub fn spawn(
        proxy: AssignmentProxy,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(run(Arc::new(proxy), rx, shutdown));
        (Self { tx }, task)
    }

    /// One request/reply round-trip.
    pub async fn assign(&self, zone: ZoneId) -> Result<ServerAssignment, AssignmentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AssignRequest { zone, reply })
            .await
            .map_err(|_| AssignmentError::ProxyGone)?;
        rx.await.map_err(|_| AssignmentError::ProxyGone)?
    }
}

async fn run(
    proxy: Arc<AssignmentProxy>,
    mut rx: mpsc::Receiver<AssignRequest>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(zones = proxy.zones.len(), "assignment proxy started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("assignment proxy shutting down");
                return;
            }
            req = rx.recv() => {
                let Some(req) = req else {
                    tracing::info!("all proxy handles dropped, proxy exiting");
                    return;
                };
                let outcome = proxy.assign(req.zone);
                match &outcome {
                    Ok(a) => tracing::debug!(zone = %req.zone, worker = %a.worker, "assigned"),
                    Err(e) => tracing::debug!(zone = %req.zone, error = %e, "assignment refused"),
                }
                let _ = req.reply.send(outcome);
            }
        }
    }
}
