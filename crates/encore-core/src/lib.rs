//! encore-core — shared types for the Encore query service: identifiers,
//! the query grammar, the query envelope lifecycle, and configuration.
//! All other Encore crates depend on this one.

pub mod assignment;
pub mod config;
pub mod envelope;
pub mod ids;
pub mod query;

pub use assignment::ServerAssignment;
pub use envelope::{now_us, LifecycleError, QueryEnvelope, QueryState, Stage, Timestamps};
pub use ids::{ClientId, QueryId, WorkerId, ZoneId};
pub use query::{ProtocolError, Query, QueryKind, QueryResult};
