//! Encore integration test harness.
//!
//! Each test starts a whole topology in-process (proxy, workers, clients)
//! over a fixture dataset written to a temp dir, and shuts it down again.
//!
//!   cargo test --test integration

mod cache;
mod dispatch;
mod failures;
mod infra;

pub use infra::*;
