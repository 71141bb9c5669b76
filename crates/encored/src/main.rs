//! encored — runs an Encore topology in-process and feeds it a query file.
//!
//! Usage: `encored <queries-file>`. One report per client is written to
//! `client.report_dir`.

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use encore_core::config::EncoreConfig;
use encore_core::ClientId;
use encore_services::{BatchReport, Client, FileReportSink, ReportError, Topology};

mod input;

use input::InputLine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = EncoreConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = EncoreConfig::load().context("failed to load config")?;

    let input_path = std::env::args()
        .nth(1)
        .context("usage: encored <queries-file>")?;
    let text = std::fs::read_to_string(&input_path)
        .with_context(|| format!("failed to read {input_path}"))?;
    let lines = input::parse(&text).with_context(|| format!("invalid input {input_path}"))?;
    tracing::info!(path = %input_path, queries = lines.len(), "encored starting");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    // subscribe before the signal task exists
    let shutdown_rx = shutdown_tx.subscribe();

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let topology = Topology::start(&config, &shutdown_tx).context("failed to start topology")?;

    // ── Spawn clients ────────────────────────────────────────────────────────

    let batches = input::distribute(lines, config.client.count as usize);
    let mut inboxes = Vec::new();
    for (i, batch) in batches.into_iter().enumerate() {
        let id = ClientId(i as u32 + 1);
        let (client, inbox) = topology.client(id, &config.client);
        let sink = FileReportSink::new(&config.client.report_dir, config.client.report_format);
        inboxes.push(tokio::spawn(inbox.run(sink)));
        tokio::spawn(drive(client, batch));
    }

    // ── Wait for reports ─────────────────────────────────────────────────────

    let failed = await_reports(inboxes, shutdown_rx).await;

    for stats in topology.worker_stats() {
        tracing::info!(
            worker = %stats.worker,
            received = stats.received,
            executed = stats.executed,
            cache_hits = stats.cache_hits,
            delivery_failures = stats.delivery_failures,
            cache_users = stats.cache.users,
            cache_hit_rate = stats.cache.hit_rate(),
            "worker stats"
        );
    }

    let _ = shutdown_tx.send(());
    topology.join().await;

    if failed > 0 {
        anyhow::bail!("{failed} report(s) could not be written");
    }
    Ok(())
}

/// Wait for every inbox to flush, or for shutdown. Returns the number of
/// reports that failed.
async fn await_reports(
    inboxes: Vec<JoinHandle<Result<BatchReport, ReportError>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> usize {
    let all_reports = async {
        let mut failed = 0usize;
        for inbox in inboxes {
            match inbox.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::error!(error = %e, "report flush failed");
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(error = %e, "client inbox panicked");
                }
            }
        }
        failed
    };

    tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("interrupted before every batch completed");
            0
        }
        failed = all_reports => failed,
    }
}

/// Send one client's lines in order, then seal its batch.
async fn drive(mut client: Client, batch: Vec<InputLine>) {
    for line in batch {
        if let Err(e) = client.send_query(&line.query, line.zone).await {
            if e.is_fatal() {
                tracing::error!(
                    client = %client.id(),
                    line = line.lineno,
                    error = %e,
                    "client stopped"
                );
                break;
            }
            tracing::warn!(client = %client.id(), line = line.lineno, error = %e, "query not sent");
        }
    }
    client.finish();
}
