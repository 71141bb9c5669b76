use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use encore_core::{ProtocolError, ZoneId};
use encore_services::{
    AssignmentError, ClientError, SubmitError, Topology, TopologyError,
};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Rejected before dispatch
// ══════════════════════════════════════════════════════════════════════════════

/// A wrong argument count fails parsing and never reaches a worker.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_arity_error_never_dispatched() -> Result<()> {
    let harness = Harness::start("arity", &[1])?;
    let run = harness
        .run_client(1, &[("getTimesPlayedByUser(M1)", 1)])
        .await?;

    assert_eq!(run.errors.len(), 1);
    assert!(matches!(
        run.errors[0],
        ClientError::Protocol(ProtocolError::Arity {
            expected: 2,
            found: 1,
            ..
        })
    ));
    assert_eq!(run.report.sent, 0);
    assert!(harness.topology.worker_stats().iter().all(|s| s.received == 0));

    harness.stop().await;
    Ok(())
}

/// An unregistered zone is refused with no worker side effect.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregistered_zone_is_invalid() -> Result<()> {
    let harness = Harness::start("zone", &[1, 1])?;

    let err = harness.topology.proxy().assign(ZoneId(9)).await.unwrap_err();
    assert_eq!(err, AssignmentError::InvalidZone(ZoneId(9)));

    let run = harness.run_client(1, &[("getTimesPlayed(M1)", 9)]).await?;
    assert!(matches!(
        run.errors[0],
        ClientError::Assignment(AssignmentError::InvalidZone(ZoneId(9)))
    ));
    assert!(run.errors[0].is_fatal());
    assert_eq!(run.report.sent, 0);
    assert!(harness.topology.worker_stats().iter().all(|s| s.received == 0));

    // the refusal moved no cursor: zone 1 still starts at its first worker
    let a = harness.topology.proxy().assign(ZoneId(1)).await?;
    assert_eq!(a.worker.as_str(), "z1w1");

    harness.stop().await;
    Ok(())
}

/// A zone with no workers is unavailable.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_zone_is_unavailable() -> Result<()> {
    let harness = Harness::start("empty", &[1, 0])?;
    let run = harness.run_client(1, &[("getTimesPlayed(M1)", 2)]).await?;
    assert!(matches!(
        run.errors[0],
        ClientError::Assignment(AssignmentError::Unavailable(ZoneId(2)))
    ));
    assert_eq!(run.report.sent, 0);

    harness.stop().await;
    Ok(())
}

/// A worker whose dataset cannot be read refuses to start.
#[tokio::test]
async fn test_missing_dataset_refuses_start() -> Result<()> {
    let dir = scratch_dir("nodata")?;
    let config = config(dir.join("absent.csv"), &[1]);
    let (shutdown, _) = broadcast::channel(1);
    match Topology::start(&config, &shutdown) {
        Err(TopologyError::DatasetUnavailable { worker, .. }) => assert_eq!(worker, "z1w1"),
        Ok(_) => panic!("topology started without its dataset"),
    }
    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Lost or late results
// ══════════════════════════════════════════════════════════════════════════════

/// A result that misses its deadline is abandoned, the batch still
/// completes, and the late delivery is counted as a failure by the worker.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overdue_query_abandoned_and_batch_completes() -> Result<()> {
    let engine = Arc::new(StallingEngine(Duration::from_millis(600)));
    let harness = Harness::with_engine("deadline", &[1], engine, |c| {
        c.client.deadline_ms = 100;
        c.client.sweep_interval_ms = 20;
    })?;

    let run = harness
        .run_client(1, &[("getTopArtistsByUserGenre(U1,rock)", 1)])
        .await?;
    assert_eq!(run.report.sent, 1);
    assert_eq!(run.report.received, 0);
    assert_eq!(run.report.abandoned, 1);
    assert!(run.report.render_text().contains("1 of 1 queries abandoned"));

    // the client deregistered once its batch completed
    let mut failures = 0;
    for _ in 0..100 {
        failures = harness.topology.worker_stats()[0].delivery_failures;
        if failures == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(failures, 1);

    harness.stop().await;
    Ok(())
}

/// A full worker queue rejects submissions; rejected queries count toward
/// completion and the client keeps going.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overloaded_worker_rejects_without_stalling_batch() -> Result<()> {
    let engine = Arc::new(StallingEngine(Duration::from_millis(200)));
    let harness = Harness::with_engine("overload", &[1], engine, |c| {
        c.worker.execution_lanes = 1;
        c.worker.queue_depth = 1;
    })?;

    let run = harness
        .run_client(1, &[("getTimesPlayed(M1)", 1); 6])
        .await?;
    assert!(!run.errors.is_empty());
    assert!(run.errors.iter().all(|e| matches!(
        e,
        ClientError::Submit(SubmitError::Overloaded { .. })
    ) && !e.is_fatal()));

    let report = &run.report;
    assert_eq!(report.sent, 6);
    assert_eq!(report.abandoned as usize, run.errors.len());
    assert_eq!(report.received + report.abandoned, 6);

    harness.stop().await;
    Ok(())
}
