//! Batch report — one line per delivered query, then per-kind averages.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

use encore_core::config::ReportFormat;
use encore_core::{ClientId, Query, QueryKind, QueryResult};

use crate::stats::{BatchStats, CompletedQuery, KindAverages};

#[derive(Debug, Clone, Serialize)]
pub struct KindSummary {
    pub kind: QueryKind,
    #[serde(flatten)]
    pub averages: KindAverages,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub client: ClientId,
    pub sent: u64,
    pub received: u64,
    pub abandoned: u64,
    /// Delivered queries in arrival order.
    pub queries: Vec<CompletedQuery>,
    pub averages: Vec<KindSummary>,
}

impl BatchReport {
    pub fn from_batch(client: ClientId, batch: BatchStats) -> Self {
        let averages = batch
            .averages()
            .into_iter()
            .map(|(kind, averages)| KindSummary { kind, averages })
            .collect();
        Self {
            client,
            sent: batch.sent(),
            received: batch.received(),
            abandoned: batch.abandoned(),
            averages,
            queries: batch.into_completed(),
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for q in &self.queries {
            let _ = writeln!(out, "{}", render_line(q));
        }
        if self.abandoned > 0 {
            let _ = writeln!(
                out,
                "\n{} of {} queries abandoned after their deadline.",
                self.abandoned, self.sent
            );
        }
        for s in &self.averages {
            let method = s.kind.method();
            let a = &s.averages;
            let _ = write!(
                out,
                "\nAverage turnaround time for {method} queries: {:.3}ms\n\
                 Average execution time for {method} queries: {:.3}ms\n\
                 Average waiting time for {method} queries: {:.3}ms\n",
                a.turnaround_ms, a.execution_ms, a.waiting_ms
            );
        }
        out
    }

    pub fn render(&self, format: ReportFormat) -> Result<String, ReportError> {
        match format {
            ReportFormat::Text => Ok(self.render_text()),
            ReportFormat::Json => {
                serde_json::to_string_pretty(self).map_err(ReportError::Serialize)
            }
        }
    }
}

fn ms(us: u64) -> f64 {
    us as f64 / 1_000.0
}

fn list(ids: &[String]) -> String {
    format!("[{}]", ids.join(", "))
}

/// Human-readable answer for one query.
pub fn summarize(query: &Query, result: &QueryResult) -> String {
    match (query, result) {
        (Query::TimesPlayed { music_id }, QueryResult::TimesPlayed(n)) => {
            format!("Music '{music_id}' was played {n} times.")
        }
        (Query::TimesPlayedByUser { music_id, user_id }, QueryResult::TimesPlayedByUser(n)) => {
            format!("Music '{music_id}' was played {n} times by user '{user_id}'.")
        }
        (Query::TopThreeMusicByUser { user_id }, QueryResult::TopThreeMusicByUser(ids)) => {
            format!("Top 3 music for user '{user_id}' were {}.", list(ids))
        }
        (
            Query::TopArtistsByUserGenre { user_id, genre },
            QueryResult::TopArtistsByUserGenre(ids),
        ) => format!(
            "Top 3 artists for genre '{genre}' and user '{user_id}' were {}.",
            list(ids)
        ),
        // complete() rejects mismatched results, so this only shows up in hand-built reports
        (query, result) => format!("{query} answered with {result:?}."),
    }
}

pub fn render_line(q: &CompletedQuery) -> String {
    let cache = if q.served_from_cache { ", from cache" } else { "" };
    format!(
        "{} (Turnaround time: {:.3}ms, execution time: {:.3}ms, waiting time: {:.3}ms, processed by server: {}{cache})",
        summarize(&q.query, &q.result),
        ms(q.turnaround_us),
        ms(q.execution_us),
        ms(q.waiting_us),
        q.processed_by,
    )
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to write report {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize report: {0}")]
    Serialize(serde_json::Error),
    #[error("report receiver closed")]
    Closed,
}

/// Destination for a finished batch. Called exactly once per client.
pub trait ReportSink: Send {
    fn flush(&self, report: &BatchReport) -> Result<(), ReportError>;
}

/// Writes `<dir>/client_<n>.txt` or `.json`.
pub struct FileReportSink {
    dir: PathBuf,
    format: ReportFormat,
}

impl FileReportSink {
    pub fn new(dir: impl Into<PathBuf>, format: ReportFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn path_for(&self, client: ClientId) -> PathBuf {
        let ext = match self.format {
            ReportFormat::Text => "txt",
            ReportFormat::Json => "json",
        };
        self.dir.join(format!("{client}.{ext}"))
    }
}

impl ReportSink for FileReportSink {
    fn flush(&self, report: &BatchReport) -> Result<(), ReportError> {
        let path = self.path_for(report.client);
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| ReportError::WriteFailed(self.dir.clone(), e))?;
        let body = report.render(self.format)?;
        std::fs::write(&path, body).map_err(|e| ReportError::WriteFailed(path.clone(), e))?;
        tracing::info!(client = %report.client, path = %path.display(), "report written");
        Ok(())
    }
}

impl ReportSink for mpsc::UnboundedSender<BatchReport> {
    fn flush(&self, report: &BatchReport) -> Result<(), ReportError> {
        self.send(report.clone()).map_err(|_| ReportError::Closed)
    }
}
