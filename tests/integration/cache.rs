use std::sync::Arc;

use anyhow::Result;
use encore_core::QueryResult;

use crate::*;

/// A repeat user+genre query is answered from cache without the engine.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeat_query_skips_engine() -> Result<()> {
    let engine = Arc::new(CountingEngine::new());
    let harness = Harness::with_engine("hit", &[1], engine.clone(), |_| {})?;

    let first = harness
        .run_client(1, &[("getTopArtistsByUserGenre(U1,rock)", 1)])
        .await?;
    assert_eq!(engine.calls(), 1);

    let second = harness
        .run_client(2, &[("getTopArtistsByUserGenre(U1,rock)", 1)])
        .await?;
    assert_eq!(engine.calls(), 1, "engine ran for a cached query");

    let (a, b) = (&first.report.queries[0], &second.report.queries[0]);
    assert!(!a.served_from_cache);
    assert!(b.served_from_cache);
    assert_eq!(a.result, b.result);
    assert_eq!(
        b.result,
        QueryResult::TopArtistsByUserGenre(vec!["A4".into(), "A1".into(), "A2".into()])
    );

    let stats = &harness.topology.worker_stats()[0];
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache.users, 1);

    harness.stop().await;
    Ok(())
}

/// Top-3 music fills the all-music list, which then answers
/// times-played-by-user for the same user.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_music_list_answers_times_played_by_user() -> Result<()> {
    let engine = Arc::new(CountingEngine::new());
    let harness = Harness::with_engine("allmusic", &[1], engine.clone(), |_| {})?;

    let run = harness
        .run_client(1, &[("getTopThreeMusicByUser(U1)", 1)])
        .await?;
    assert_eq!(run.report.received, 1);

    let run = harness
        .run_client(2, &[("getTimesPlayedByUser(M1,U1)", 1)])
        .await?;
    let q = &run.report.queries[0];
    assert!(q.served_from_cache);
    assert_eq!(q.result, QueryResult::TimesPlayedByUser(12));
    assert_eq!(engine.calls(), 1);

    harness.stop().await;
    Ok(())
}

/// Times-played is not user-keyed and always runs the engine.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_times_played_is_never_cached() -> Result<()> {
    let engine = Arc::new(CountingEngine::new());
    let harness = Harness::with_engine("uncached", &[1], engine.clone(), |_| {})?;

    let run = harness
        .run_client(1, &[("getTimesPlayed(M1)", 1), ("getTimesPlayed(M1)", 1)])
        .await?;
    assert_eq!(run.report.received, 2);
    assert!(run.report.queries.iter().all(|q| !q.served_from_cache));
    assert_eq!(engine.calls(), 2);

    harness.stop().await;
    Ok(())
}

/// Each worker keeps its own cache.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_caches_are_per_worker() -> Result<()> {
    let engine = Arc::new(CountingEngine::new());
    let harness = Harness::with_engine("perworker", &[1, 1], engine.clone(), |_| {})?;

    harness
        .run_client(1, &[("getTopArtistsByUserGenre(U1,rock)", 1)])
        .await?;
    let run = harness
        .run_client(2, &[("getTopArtistsByUserGenre(U1,rock)", 2)])
        .await?;
    assert!(!run.report.queries[0].served_from_cache);
    assert_eq!(engine.calls(), 2);

    harness.stop().await;
    Ok(())
}

/// With one category per user, a second genre evicts the first.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_category_bound_evicts_older_genre() -> Result<()> {
    let engine = Arc::new(CountingEngine::new());
    let harness = Harness::with_engine("evict", &[1], engine.clone(), |c| {
        c.worker.max_categories_per_user = 1;
    })?;

    harness
        .run_client(1, &[("getTopArtistsByUserGenre(U1,rock)", 1)])
        .await?;
    harness
        .run_client(2, &[("getTopArtistsByUserGenre(U1,jazz)", 1)])
        .await?;
    let run = harness
        .run_client(3, &[("getTopArtistsByUserGenre(U1,rock)", 1)])
        .await?;
    assert!(!run.report.queries[0].served_from_cache);
    assert_eq!(engine.calls(), 3);

    harness.stop().await;
    Ok(())
}
