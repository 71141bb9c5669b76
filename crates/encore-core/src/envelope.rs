//! Query envelope — the unit of work moved between client and worker.
//!
//! Lifecycle, one timestamp per transition:
//!
//!   CREATED → SENT(t0) → ENQUEUED(t1) → EXECUTING(t2) → COMPLETED(t3)
//!           → DELIVERED(t4) → RETIRED
//!
//! No transition may be skipped or repeated. Timestamps are microseconds
//! since the Unix epoch; a reading earlier than the previous stamp is clamped
//! to it, so `t0 ≤ t1 ≤ t2 ≤ t3 ≤ t4` holds even across wall-clock steps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ids::{ClientId, QueryId, WorkerId, ZoneId};
use crate::query::{Query, QueryKind, QueryResult};

pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ── Stages ────────────────────────────────────────────────────────────────────

/// A stamped lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// t0: sent by the client.
    Sent,
    /// t1: received by the worker.
    Enqueued,
    /// t2: dequeued for execution.
    Executing,
    /// t3: execution finished.
    Completed,
    /// t4: received back by the client.
    Delivered,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Sent,
        Stage::Enqueued,
        Stage::Executing,
        Stage::Completed,
        Stage::Delivered,
    ];

    fn index(self) -> usize {
        match self {
            Stage::Sent => 0,
            Stage::Enqueued => 1,
            Stage::Executing => 2,
            Stage::Completed => 3,
            Stage::Delivered => 4,
        }
    }

    pub fn previous(self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Sent => "t0/sent",
            Stage::Enqueued => "t1/enqueued",
            Stage::Executing => "t2/executing",
            Stage::Completed => "t3/completed",
            Stage::Delivered => "t4/delivered",
        };
        f.write_str(label)
    }
}

/// Observable state of an envelope, derived from its stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Created,
    Sent,
    Enqueued,
    Executing,
    Completed,
    Delivered,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0} already stamped")]
    AlreadyStamped(Stage),
    #[error("cannot stamp {stage} before {missing}")]
    OutOfOrder { stage: Stage, missing: Stage },
    #[error("result kind {found} does not answer a {expected} query")]
    ResultMismatch { expected: QueryKind, found: QueryKind },
    #[error("envelope must be delivered before it is retired")]
    NotDelivered,
}

// ── Timestamps ────────────────────────────────────────────────────────────────

/// The five lifecycle stamps, each set at most once and in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    stamps: [Option<u64>; 5],
}

impl Timestamps {
    pub fn get(&self, stage: Stage) -> Option<u64> {
        self.stamps[stage.index()]
    }

    /// Stamp `stage` with the current time.
    pub fn stamp(&mut self, stage: Stage) -> Result<u64, LifecycleError> {
        self.stamp_at(stage, now_us())
    }

    /// Stamp `stage` at `at_us`, clamped to the previous stamp.
    pub fn stamp_at(&mut self, stage: Stage, at_us: u64) -> Result<u64, LifecycleError> {
        if self.get(stage).is_some() {
            return Err(LifecycleError::AlreadyStamped(stage));
        }
        let mut at = at_us;
        if let Some(prev) = stage.previous() {
            let prev_at = self.get(prev).ok_or(LifecycleError::OutOfOrder {
                stage,
                missing: prev,
            })?;
            at = at.max(prev_at);
        }
        self.stamps[stage.index()] = Some(at);
        Ok(at)
    }

    /// The last stage stamped so far.
    pub fn latest(&self) -> Option<Stage> {
        Stage::ALL.into_iter().rev().find(|s| self.get(*s).is_some())
    }

    fn span(&self, from: Stage, to: Stage) -> Option<u64> {
        Some(self.get(to)?.saturating_sub(self.get(from)?))
    }

    /// t4 - t0.
    pub fn turnaround_us(&self) -> Option<u64> {
        self.span(Stage::Sent, Stage::Delivered)
    }

    /// t3 - t2.
    pub fn execution_us(&self) -> Option<u64> {
        self.span(Stage::Executing, Stage::Completed)
    }

    /// t2 - t1.
    pub fn waiting_us(&self) -> Option<u64> {
        self.span(Stage::Enqueued, Stage::Executing)
    }

    pub fn is_monotonic(&self) -> bool {
        let set: Vec<u64> = self.stamps.iter().flatten().copied().collect();
        set.windows(2).all(|w| w[0] <= w[1])
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Request/result record. Created by a client, moved by value to the worker
/// and back; whoever holds it may stamp the next stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub id: QueryId,
    pub client: ClientId,
    pub zone: ZoneId,
    pub query: Query,
    timestamps: Timestamps,
    result: Option<QueryResult>,
    processed_by: Option<WorkerId>,
    served_from_cache: bool,
    deadline_us: Option<u64>,
    retired: bool,
}

impl QueryEnvelope {
    /// `seq` is the client's sequence number for this query.
    pub fn new(client: ClientId, zone: ZoneId, seq: u64, query: Query) -> Self {
        Self {
            id: QueryId::derive(client, seq, &query),
            client,
            zone,
            query,
            timestamps: Timestamps::default(),
            result: None,
            processed_by: None,
            served_from_cache: false,
            deadline_us: None,
            retired: false,
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.query.kind()
    }

    pub fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    pub fn stamp(&mut self, stage: Stage) -> Result<u64, LifecycleError> {
        self.timestamps.stamp(stage)
    }

    pub fn stamp_at(&mut self, stage: Stage, at_us: u64) -> Result<u64, LifecycleError> {
        self.timestamps.stamp_at(stage, at_us)
    }

    /// Record the result and the executing worker, then stamp t3.
    ///
    /// The envelope must be executing (t2 set, t3 unset) and the result must
    /// answer this envelope's query kind.
    pub fn complete(
        &mut self,
        worker: WorkerId,
        result: QueryResult,
        from_cache: bool,
    ) -> Result<u64, LifecycleError> {
        self.complete_at(worker, result, from_cache, now_us())
    }

    /// `complete` with an explicit t3 reading.
    pub fn complete_at(
        &mut self,
        worker: WorkerId,
        result: QueryResult,
        from_cache: bool,
        at_us: u64,
    ) -> Result<u64, LifecycleError> {
        if result.kind() != self.kind() {
            return Err(LifecycleError::ResultMismatch {
                expected: self.kind(),
                found: result.kind(),
            });
        }
        let at = self.timestamps.stamp_at(Stage::Completed, at_us)?;
        self.result = Some(result);
        self.processed_by = Some(worker);
        self.served_from_cache = from_cache;
        Ok(at)
    }

    pub fn result(&self) -> Option<&QueryResult> {
        self.result.as_ref()
    }

    pub fn processed_by(&self) -> Option<&WorkerId> {
        self.processed_by.as_ref()
    }

    pub fn served_from_cache(&self) -> bool {
        self.served_from_cache
    }

    pub fn deadline_us(&self) -> Option<u64> {
        self.deadline_us
    }

    pub fn set_deadline_us(&mut self, deadline_us: u64) {
        self.deadline_us = Some(deadline_us);
    }

    /// Mark a delivered envelope as folded into statistics.
    pub fn retire(&mut self) -> Result<(), LifecycleError> {
        if self.timestamps.get(Stage::Delivered).is_none() {
            return Err(LifecycleError::NotDelivered);
        }
        self.retired = true;
        Ok(())
    }

    pub fn state(&self) -> QueryState {
        if self.retired {
            return QueryState::Retired;
        }
        match self.timestamps.latest() {
            None => QueryState::Created,
            Some(Stage::Sent) => QueryState::Sent,
            Some(Stage::Enqueued) => QueryState::Enqueued,
            Some(Stage::Executing) => QueryState::Executing,
            Some(Stage::Completed) => QueryState::Completed,
            Some(Stage::Delivered) => QueryState::Delivered,
        }
    }
}
