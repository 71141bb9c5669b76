//! Batch aggregation — one client's view of its dispatched queries.
//!
//! Owned by the client's consumer task, so nothing here is shared or locked.
//! A batch is complete once it is sealed and every dispatched query has been
//! delivered or abandoned.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use encore_core::{
    LifecycleError, Query, QueryEnvelope, QueryId, QueryKind, QueryResult, Timestamps, WorkerId,
};

/// A delivered query as it appears in the report.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedQuery {
    pub id: QueryId,
    pub query: Query,
    pub result: QueryResult,
    pub processed_by: WorkerId,
    pub served_from_cache: bool,
    pub timestamps: Timestamps,
    pub turnaround_us: u64,
    pub execution_us: u64,
    pub waiting_us: u64,
}

/// Timing sums for one query kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindTimings {
    pub count: u64,
    pub turnaround_us: u64,
    pub execution_us: u64,
    pub waiting_us: u64,
}

/// Per-kind averages in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KindAverages {
    pub count: u64,
    pub turnaround_ms: f64,
    pub execution_ms: f64,
    pub waiting_ms: f64,
}

impl KindTimings {
    fn add(&mut self, q: &CompletedQuery) {
        self.count += 1;
        self.turnaround_us += q.turnaround_us;
        self.execution_us += q.execution_us;
        self.waiting_us += q.waiting_us;
    }

    /// Averages over the delivered queries of this kind. Zero when none.
    pub fn averages(&self) -> KindAverages {
        let avg = |sum: u64| {
            if self.count == 0 {
                0.0
            } else {
                sum as f64 / self.count as f64 / 1_000.0
            }
        };
        KindAverages {
            count: self.count,
            turnaround_ms: avg(self.turnaround_us),
            execution_ms: avg(self.execution_us),
            waiting_ms: avg(self.waiting_us),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("delivered envelope {0} carries no result")]
    MissingResult(QueryId),
}

/// What happened to an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    /// Arrived after its deadline sweep abandoned it.
    Late,
    /// Never dispatched by this client, or already delivered.
    Unknown,
}

#[derive(Debug, Clone)]
struct Pending {
    kind: QueryKind,
    deadline_us: Option<u64>,
}

#[derive(Debug, Default)]
pub struct BatchStats {
    sent: u64,
    received: u64,
    abandoned: u64,
    sealed: bool,
    pending: HashMap<QueryId, Pending>,
    abandoned_ids: HashSet<QueryId>,
    completed: Vec<CompletedQuery>,
    timings: BTreeMap<QueryKind, KindTimings>,
}

impl BatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatched query. Must precede its delivery.
    pub fn record_dispatch(&mut self, id: QueryId, kind: QueryKind, deadline_us: Option<u64>) {
        self.sent += 1;
        self.pending.insert(id, Pending { kind, deadline_us });
    }

    /// Fold a delivered envelope (t4 already stamped) into the batch.
    pub fn record_delivery(
        &mut self,
        mut envelope: QueryEnvelope,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if self.abandoned_ids.contains(&envelope.id) {
            return Ok(DeliveryOutcome::Late);
        }
        if !self.pending.contains_key(&envelope.id) {
            return Ok(DeliveryOutcome::Unknown);
        }

        envelope.retire()?;
        let ts = envelope.timestamps().clone();
        let result = envelope
            .result()
            .cloned()
            .ok_or_else(|| DeliveryError::MissingResult(envelope.id.clone()))?;
        let processed_by = envelope
            .processed_by()
            .cloned()
            .ok_or_else(|| DeliveryError::MissingResult(envelope.id.clone()))?;

        self.pending.remove(&envelope.id);
        self.received += 1;
        let completed = CompletedQuery {
            turnaround_us: ts.turnaround_us().unwrap_or(0),
            execution_us: ts.execution_us().unwrap_or(0),
            waiting_us: ts.waiting_us().unwrap_or(0),
            served_from_cache: envelope.served_from_cache(),
            id: envelope.id,
            query: envelope.query,
            result,
            processed_by,
            timestamps: ts,
        };
        self.timings
            .entry(completed.query.kind())
            .or_default()
            .add(&completed);
        self.completed.push(completed);
        Ok(DeliveryOutcome::Accepted)
    }

    /// Stop waiting for `id`. Returns false if it was not pending.
    pub fn abandon(&mut self, id: &QueryId) -> bool {
        match self.pending.remove(id) {
            Some(_) => {
                self.abandoned += 1;
                self.abandoned_ids.insert(id.clone());
                true
            }
            None => false,
        }
    }

    /// Abandon every pending query whose deadline is at or before `now_us`.
    pub fn sweep(&mut self, now_us: u64) -> Vec<(QueryId, QueryKind)> {
        let overdue: Vec<(QueryId, QueryKind)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline_us.is_some_and(|d| d <= now_us))
            .map(|(id, p)| (id.clone(), p.kind))
            .collect();
        for (id, _) in &overdue {
            self.abandon(id);
        }
        overdue
    }

    /// Abandon everything still pending.
    pub fn abandon_all(&mut self) -> usize {
        let ids: Vec<QueryId> = self.pending.keys().cloned().collect();
        for id in &ids {
            self.abandon(id);
        }
        ids.len()
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_complete(&self) -> bool {
        self.sealed && self.received + self.abandoned == self.sent
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Delivered queries in arrival order.
    pub fn completed(&self) -> &[CompletedQuery] {
        &self.completed
    }

    pub fn timings(&self, kind: QueryKind) -> KindTimings {
        self.timings.get(&kind).copied().unwrap_or_default()
    }

    /// Per-kind averages for every kind, in `QueryKind::ALL` order.
    pub fn averages(&self) -> Vec<(QueryKind, KindAverages)> {
        QueryKind::ALL
            .into_iter()
            .map(|k| (k, self.timings(k).averages()))
            .collect()
    }

    pub fn into_completed(self) -> Vec<CompletedQuery> {
        self.completed
    }
}
