//! Client — submits queries and aggregates their asynchronous results.
//!
//! Split in two halves sharing one event channel:
//!
//! - `Client` (sending side): parses a query, asks the proxy for a worker,
//!   stamps t0, records the dispatch on the channel, then submits. The
//!   dispatch event is queued before the worker can possibly deliver, so the
//!   inbox always sees a dispatch before its delivery.
//! - `ClientInbox` (receiving side): a single task owning the `BatchStats`.
//!   Workers push deliveries through a `ClientHandle`. The batch completes
//!   once the client is sealed and every dispatch is delivered or abandoned;
//!   the report is then flushed exactly once.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use encore_core::config::ClientSettings;
use encore_core::{
    now_us, ClientId, ProtocolError, Query, QueryEnvelope, QueryId, QueryKind, ServerAssignment,
    Stage, ZoneId,
};

use crate::directory::{DeliveryFailure, Directory, LookupError};
use crate::proxy::{AssignmentError, ProxyHandle};
use crate::report::{BatchReport, ReportError, ReportSink};
use crate::stats::{BatchStats, DeliveryOutcome};
use crate::worker::SubmitError;

#[derive(Debug)]
pub enum ClientEvent {
    Dispatched {
        id: QueryId,
        kind: QueryKind,
        deadline_us: Option<u64>,
    },
    Delivered(QueryEnvelope),
    /// Submission failed after the dispatch was recorded.
    Failed { id: QueryId, reason: String },
    /// No more dispatches will follow.
    Seal,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Assignment(#[from] AssignmentError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("{0} already sealed its batch")]
    Sealed(ClientId),
    #[error("{0} inbox is gone")]
    InboxGone(ClientId),
}

impl ClientError {
    /// Errors after which the client must stop issuing queries.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ClientError::Submit(_) | ClientError::Lookup(_))
    }
}

// ── Delivery endpoint ─────────────────────────────────────────────────────────

/// What workers hold to reach a client.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientHandle {
    pub fn new(id: ClientId, tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn deliver(&self, envelope: QueryEnvelope) -> Result<(), DeliveryFailure> {
        let query = envelope.id.clone();
        self.tx
            .send(ClientEvent::Delivered(envelope))
            .map_err(|_| DeliveryFailure::Disconnected {
                client: self.id,
                query,
            })
    }
}

// ── Sending side ──────────────────────────────────────────────────────────────

pub struct Client {
    id: ClientId,
    seq: u64,
    proxy: ProxyHandle,
    directory: Directory,
    tx: mpsc::UnboundedSender<ClientEvent>,
    deadline: Option<Duration>,
    sealed: bool,
}

impl Client {
    /// Create a client and register its delivery endpoint in `directory`.
    pub fn new(
        id: ClientId,
        proxy: ProxyHandle,
        directory: Directory,
        settings: &ClientSettings,
    ) -> (Self, ClientInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        directory.register_client(ClientHandle::new(id, tx.clone()));
        let deadline = (settings.deadline_ms > 0).then(|| Duration::from_millis(settings.deadline_ms));
        let inbox = ClientInbox {
            id,
            rx,
            directory: directory.clone(),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms.max(1)),
            batch: BatchStats::new(),
        };
        let client = Self {
            id,
            seq: 0,
            proxy,
            directory,
            tx,
            deadline,
            sealed: false,
        };
        (client, inbox)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// One proxy round-trip. Assignments are never cached.
    pub async fn request_assignment(&self, zone: ZoneId) -> Result<ServerAssignment, ClientError> {
        Ok(self.proxy.assign(zone).await?)
    }

    /// Parse, assign, stamp t0, and hand the query to a worker. Returns as
    /// soon as the worker accepted it; the result arrives in the inbox.
    pub async fn send_query(&mut self, text: &str, zone: ZoneId) -> Result<QueryId, ClientError> {
        if self.sealed {
            return Err(ClientError::Sealed(self.id));
        }
        let query = Query::parse(text)?;
        let assignment = self.request_assignment(zone).await?;

        let mut envelope = QueryEnvelope::new(self.id, zone, self.seq, query);
        self.seq += 1;
        let t0 = envelope
            .stamp(Stage::Sent)
            .map_err(|e| ClientError::Submit(e.into()))?;
        let deadline_us = self
            .deadline
            .map(|d| t0.saturating_add(d.as_micros() as u64));
        if let Some(d) = deadline_us {
            envelope.set_deadline_us(d);
        }

        let id = envelope.id.clone();
        self.tx
            .send(ClientEvent::Dispatched {
                id: id.clone(),
                kind: envelope.kind(),
                deadline_us,
            })
            .map_err(|_| ClientError::InboxGone(self.id))?;

        tracing::debug!(
            client = %self.id,
            query = id.short(),
            zone = %zone,
            worker = %assignment.worker,
            "query sent"
        );

        let submitted = self
            .directory
            .resolve(&assignment)
            .map_err(ClientError::from)
            .and_then(|worker| worker.submit(envelope).map_err(ClientError::from));
        if let Err(e) = submitted {
            tracing::warn!(client = %self.id, query = id.short(), error = %e, "submit failed");
            let _ = self.tx.send(ClientEvent::Failed {
                id: id.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        Ok(id)
    }

    /// Seal the batch: no more queries follow.
    pub fn finish(mut self) {
        self.seal();
    }

    fn seal(&mut self) {
        if !self.sealed {
            self.sealed = true;
            let _ = self.tx.send(ClientEvent::Seal);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.seal();
    }
}

// ── Receiving side ────────────────────────────────────────────────────────────

pub struct ClientInbox {
    id: ClientId,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
    directory: Directory,
    sweep_interval: Duration,
    batch: BatchStats,
}

impl ClientInbox {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Drain events until the batch completes, then flush the report once.
    pub async fn run<S: ReportSink>(mut self, sink: S) -> Result<BatchReport, ReportError> {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.batch.is_complete() {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.apply(event),
                    None => {
                        // unreachable while the directory holds our handle
                        let n = self.batch.abandon_all();
                        self.batch.seal();
                        tracing::warn!(client = %self.id, abandoned = n, "event channel closed");
                    }
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        self.directory.deregister_client(self.id);
        tracing::info!(
            client = %self.id,
            sent = self.batch.sent(),
            received = self.batch.received(),
            abandoned = self.batch.abandoned(),
            "batch complete"
        );
        let report = BatchReport::from_batch(self.id, self.batch);
        sink.flush(&report)?;
        Ok(report)
    }

    fn apply(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Dispatched {
                id,
                kind,
                deadline_us,
            } => self.batch.record_dispatch(id, kind, deadline_us),
            ClientEvent::Delivered(mut envelope) => {
                if let Err(e) = envelope.stamp(Stage::Delivered) {
                    tracing::error!(client = %self.id, query = envelope.id.short(), error = %e, "bad delivery");
                    return;
                }
                let query = envelope.id.clone();
                match self.batch.record_delivery(envelope) {
                    Ok(DeliveryOutcome::Accepted) => {
                        tracing::debug!(client = %self.id, query = query.short(), "result received");
                    }
                    Ok(DeliveryOutcome::Late) => {
                        tracing::warn!(client = %self.id, query = query.short(), "late delivery ignored");
                    }
                    Ok(DeliveryOutcome::Unknown) => {
                        tracing::warn!(client = %self.id, query = query.short(), "unexpected delivery ignored");
                    }
                    Err(e) => {
                        tracing::error!(client = %self.id, query = query.short(), error = %e, "bad delivery");
                    }
                }
            }
            ClientEvent::Failed { id, reason } => {
                if self.batch.abandon(&id) {
                    tracing::warn!(client = %self.id, query = id.short(), %reason, "query abandoned");
                }
            }
            ClientEvent::Seal => self.batch.seal(),
        }
    }

    fn sweep(&mut self) {
        for (id, kind) in self.batch.sweep(now_us()) {
            tracing::warn!(
                client = %self.id,
                query = id.short(),
                %kind,
                "deadline passed, query abandoned"
            );
        }
    }
}
