use anyhow::Result;
use encore_core::{QueryKind, QueryResult, Stage};

use crate::*;

/// Every kind round-trips through proxy, worker and client.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_kind_round_trips() -> Result<()> {
    let harness = Harness::start("kinds", &[1])?;
    let run = harness
        .run_client(
            1,
            &[
                ("getTimesPlayed(M1)", 1),
                ("getTimesPlayedByUser(M1,U1)", 1),
                ("getTopThreeMusicByUser(U1)", 1),
                ("getTopArtistsByUserGenre(U1,rock)", 1),
            ],
        )
        .await?;
    assert!(run.errors.is_empty());
    let report = &run.report;
    assert_eq!(report.sent, 4);
    assert_eq!(report.received, 4);
    assert_eq!(report.abandoned, 0);

    let answer = |kind: QueryKind| {
        report
            .queries
            .iter()
            .find(|q| q.query.kind() == kind)
            .map(|q| q.result.clone())
            .unwrap()
    };
    assert_eq!(answer(QueryKind::TimesPlayed), QueryResult::TimesPlayed(14));
    assert_eq!(
        answer(QueryKind::TimesPlayedByUser),
        QueryResult::TimesPlayedByUser(12)
    );
    assert_eq!(
        answer(QueryKind::TopThreeMusicByUser),
        QueryResult::TopThreeMusicByUser(vec!["M1".into(), "M4".into(), "M2".into()])
    );
    assert_eq!(
        answer(QueryKind::TopArtistsByUserGenre),
        QueryResult::TopArtistsByUserGenre(vec!["A4".into(), "A1".into(), "A2".into()])
    );

    harness.stop().await;
    Ok(())
}

/// t0 ≤ t1 ≤ t2 ≤ t3 ≤ t4 on every delivered envelope.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timestamps_are_monotonic() -> Result<()> {
    let harness = Harness::start("monotonic", &[2, 2])?;
    let queries: Vec<(String, u32)> = (0..40)
        .map(|i| (format!("getTimesPlayed(M{})", i % 6 + 1), i % 2 + 1))
        .collect();
    let borrowed: Vec<(&str, u32)> = queries.iter().map(|(q, z)| (q.as_str(), *z)).collect();

    let run = harness.run_client(1, &borrowed).await?;
    assert_eq!(run.report.received, 40);
    for q in &run.report.queries {
        assert!(q.timestamps.is_monotonic(), "non-monotonic stamps: {:?}", q.timestamps);
        for stage in Stage::ALL {
            assert!(q.timestamps.get(stage).is_some(), "{stage} missing");
        }
        assert_eq!(
            q.turnaround_us,
            q.timestamps.get(Stage::Delivered).unwrap() - q.timestamps.get(Stage::Sent).unwrap()
        );
    }

    harness.stop().await;
    Ok(())
}

/// Round-robin spreads one zone's queries over its workers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zone_workers_share_load() -> Result<()> {
    let harness = Harness::start("spread", &[2])?;
    let run = harness
        .run_client(1, &[("getTimesPlayed(M1)", 1); 10])
        .await?;
    assert_eq!(run.report.received, 10);

    let stats = harness.topology.worker_stats();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.received == 5), "uneven spread");
    let by_z1w1 = run
        .report
        .queries
        .iter()
        .filter(|q| q.processed_by.as_str() == "z1w1")
        .count();
    assert_eq!(by_z1w1, 5);

    harness.stop().await;
    Ok(())
}

/// Several clients at once each get exactly their own results.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_complete_independently() -> Result<()> {
    let harness = std::sync::Arc::new(Harness::start("clients", &[1, 1])?);
    let mut runs = Vec::new();
    for id in 1..=4u32 {
        let harness = harness.clone();
        runs.push(tokio::spawn(async move {
            let zone = id % 2 + 1;
            harness
                .run_client(id, &[("getTopThreeMusicByUser(U1)", zone); 8])
                .await
        }));
    }
    for run in runs {
        let run = run.await??;
        assert_eq!(run.report.sent, 8);
        assert_eq!(run.report.received, 8);
        assert!(run.report.queries.iter().all(|q| q.id.as_str().len() == 64));
    }

    if let Ok(harness) = std::sync::Arc::try_unwrap(harness) {
        harness.stop().await;
    }
    Ok(())
}

/// The report carries one line per query and four average blocks.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_text_report_layout() -> Result<()> {
    let harness = Harness::start("report", &[1])?;
    let run = harness
        .run_client(
            1,
            &[
                ("getTimesPlayedByUser(M1,U1)", 1),
                ("getTopArtistsByUserGenre(U1,rock)", 1),
            ],
        )
        .await?;
    let text = run.report.render_text();
    assert!(text.contains("Music 'M1' was played 12 times by user 'U1'."));
    assert!(text.contains("Top 3 artists for genre 'rock' and user 'U1' were [A4, A1, A2]."));
    assert!(text.contains("processed by server: z1w1"));
    assert_eq!(text.matches("Average waiting time for").count(), 4);

    harness.stop().await;
    Ok(())
}
