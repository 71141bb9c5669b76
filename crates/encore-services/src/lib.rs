//! encore-services — the running parts of Encore: dataset engine, result
//! cache, workers, assignment proxy, clients, and batch reports.

pub mod cache;
pub mod client;
pub mod dataset;
pub mod directory;
pub mod proxy;
pub mod report;
pub mod stats;
pub mod topology;
pub mod worker;

pub use cache::{CacheStats, Category, ProfileFragment, ResultCache, TopList, TOP_N};
pub use client::{Client, ClientError, ClientEvent, ClientHandle, ClientInbox};
pub use dataset::{Dataset, DatasetError, Execution, PlayRecord, QueryEngine};
pub use directory::{DeliveryFailure, Directory, LookupError};
pub use proxy::{AssignmentError, AssignmentProxy, ProxyHandle};
pub use report::{BatchReport, FileReportSink, ReportError, ReportSink};
pub use stats::{BatchStats, CompletedQuery, KindAverages, KindTimings};
pub use topology::{Topology, TopologyError};
pub use worker::{SubmitError, Worker, WorkerHandle, WorkerStats};
