use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use encore_core::config::{
    ClientSettings, EncoreConfig, TopologyConfig, WorkerConfig, ZoneConfig,
};
use encore_core::{ClientId, Query, ZoneId};
use encore_services::{
    BatchReport, ClientError, Dataset, Execution, QueryEngine, Topology,
};

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// U1 rock plays: A1 5, A2 3, A3 1, A4 9.
pub const FIXTURE: &str = "\
M1,A1,U1,rock,5
M2,A2,U1,rock,3
M3,A3,U1,rock,1
M4,A4,U1,rock,9
M5,A1,U2,rock,50
M1,A1,U1,jazz,7
M1,A1,U2,rock,2
M6,A5,A6,U2,pop,4
";

static SEQ: AtomicUsize = AtomicUsize::new(0);

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "encore-it-{tag}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

pub fn write_dataset(dir: &std::path::Path) -> Result<PathBuf> {
    let path = dir.join("plays.csv");
    std::fs::write(&path, FIXTURE).context("failed to write fixture dataset")?;
    Ok(path)
}

fn worker(name: &str, port: u16) -> WorkerConfig {
    WorkerConfig {
        name: name.to_string(),
        address: "localhost".to_string(),
        port,
        dataset: None,
    }
}

/// `zones[i]` lists the worker count of zone `i + 1`.
pub fn config(dataset: PathBuf, zones: &[usize]) -> EncoreConfig {
    let mut port = 7000;
    let zones = zones
        .iter()
        .enumerate()
        .map(|(i, &count)| ZoneConfig {
            id: i as u32 + 1,
            workers: (0..count)
                .map(|w| {
                    port += 1;
                    worker(&format!("z{}w{}", i + 1, w + 1), port)
                })
                .collect(),
        })
        .collect();

    let mut config = EncoreConfig::default();
    config.dataset.path = dataset;
    config.topology = TopologyConfig { zones };
    config.worker.execution_lanes = 4;
    config.client = ClientSettings {
        deadline_ms: 5_000,
        sweep_interval_ms: 20,
        ..ClientSettings::default()
    };
    config
}

// ── Engines ───────────────────────────────────────────────────────────────────

/// Dataset engine that counts how often it runs.
pub struct CountingEngine {
    inner: Dataset,
    calls: AtomicUsize,
}

impl CountingEngine {
    pub fn new() -> Self {
        Self {
            inner: Dataset::from_csv(FIXTURE),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl QueryEngine for CountingEngine {
    fn execute(&self, query: &Query) -> Execution {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(query)
    }
}

/// Engine that never finishes before the client gives up.
pub struct StallingEngine(pub Duration);

impl QueryEngine for StallingEngine {
    fn execute(&self, query: &Query) -> Execution {
        std::thread::sleep(self.0);
        Dataset::from_csv(FIXTURE).execute(query)
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub config: EncoreConfig,
    pub topology: Topology,
    shutdown: broadcast::Sender<()>,
    dir: PathBuf,
}

/// Outcome of one client run.
pub struct Run {
    pub report: BatchReport,
    /// Per-query send errors, in input order.
    pub errors: Vec<ClientError>,
}

impl Harness {
    /// Topology over the fixture dataset loaded from disk.
    pub fn start(tag: &str, zones: &[usize]) -> Result<Self> {
        let dir = scratch_dir(tag)?;
        let config = config(write_dataset(&dir)?, zones);
        let (shutdown, _) = broadcast::channel(1);
        let topology = Topology::start(&config, &shutdown).context("topology failed to start")?;
        Ok(Self {
            config,
            topology,
            shutdown,
            dir,
        })
    }

    /// Every worker shares `engine`.
    pub fn with_engine(
        tag: &str,
        zones: &[usize],
        engine: Arc<dyn QueryEngine>,
        tune: impl FnOnce(&mut EncoreConfig),
    ) -> Result<Self> {
        let dir = scratch_dir(tag)?;
        let mut config = config(dir.join("unused.csv"), zones);
        tune(&mut config);
        let (shutdown, _) = broadcast::channel(1);
        let topology = Topology::start_with(&config, &shutdown, |_| Ok(engine.clone()))
            .context("topology failed to start")?;
        Ok(Self {
            config,
            topology,
            shutdown,
            dir,
        })
    }

    /// Send `queries` from one client, seal, and wait for its report.
    pub async fn run_client(&self, id: u32, queries: &[(&str, u32)]) -> Result<Run> {
        let (mut client, inbox) = self.topology.client(ClientId(id), &self.config.client);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let inbox = tokio::spawn(inbox.run(report_tx));

        let mut errors = Vec::new();
        for (query, zone) in queries {
            if let Err(e) = client.send_query(query, ZoneId(*zone)).await {
                errors.push(e);
            }
        }
        client.finish();

        let report = tokio::time::timeout(Duration::from_secs(10), inbox)
            .await
            .context("batch did not complete")?
            .context("inbox task panicked")?
            .context("report flush failed")?;
        let flushed = report_rx.recv().await.context("report never flushed")?;
        anyhow::ensure!(report_rx.recv().await.is_none(), "report flushed twice");
        anyhow::ensure!(flushed.received == report.received, "flushed report differs");
        Ok(Run { report, errors })
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        self.topology.join().await;
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
