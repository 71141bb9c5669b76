//! Directory — name → endpoint lookup for workers and clients.
//!
//! Workers are bound under their `address:port` endpoint, clients under their
//! id. Shared between the topology, every worker, and every client.

use std::sync::Arc;

use dashmap::DashMap;

use encore_core::{ClientId, QueryEnvelope, QueryId, ServerAssignment};

use crate::client::ClientHandle;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("no worker bound at {0}")]
    NotBound(String),
    #[error("worker at {endpoint} is {found}, assignment named {expected}")]
    WrongWorker {
        endpoint: String,
        expected: String,
        found: String,
    },
}

/// A result that could not be handed to its client. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("{client} is not registered (query {query})")]
    UnknownClient { client: ClientId, query: QueryId },
    #[error("{client} stopped receiving (query {query})")]
    Disconnected { client: ClientId, query: QueryId },
}

#[derive(Clone, Default)]
pub struct Directory {
    workers: Arc<DashMap<String, WorkerHandle>>,
    clients: Arc<DashMap<ClientId, ClientHandle>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Workers ───────────────────────────────────────────────────────────────

    pub fn bind_worker(&self, endpoint: String, handle: WorkerHandle) {
        tracing::debug!(%endpoint, worker = %handle.id(), "worker bound");
        self.workers.insert(endpoint, handle);
    }

    /// Resolve an assignment to the worker bound at its endpoint.
    pub fn resolve(&self, assignment: &ServerAssignment) -> Result<WorkerHandle, LookupError> {
        let endpoint = assignment.endpoint();
        let handle = self
            .workers
            .get(&endpoint)
            .map(|h| h.value().clone())
            .ok_or_else(|| LookupError::NotBound(endpoint.clone()))?;
        if handle.id() != &assignment.worker {
            return Err(LookupError::WrongWorker {
                endpoint,
                expected: assignment.worker.to_string(),
                found: handle.id().to_string(),
            });
        }
        Ok(handle)
    }

    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.workers.iter().map(|e| e.value().clone()).collect()
    }

    // ── Clients ───────────────────────────────────────────────────────────────

    pub fn register_client(&self, handle: ClientHandle) {
        self.clients.insert(handle.id(), handle);
    }

    pub fn deregister_client(&self, id: ClientId) {
        self.clients.remove(&id);
    }

    pub fn has_client(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Hand a completed envelope to its originating client.
    pub fn deliver(&self, envelope: QueryEnvelope) -> Result<(), DeliveryFailure> {
        let client = envelope.client;
        // clone out of the map so the shard lock is not held across the send
        let handle = self
            .clients
            .get(&client)
            .map(|h| h.value().clone())
            .ok_or_else(|| DeliveryFailure::UnknownClient {
                client,
                query: envelope.id.clone(),
            })?;
        handle.deliver(envelope)
    }
}
