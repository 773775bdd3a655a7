// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod parse;
pub mod rollback_guard;
pub mod store;
pub mod validate;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::AutoUpdateConfig;
pub use crate::engine::{EngineHandle, MatchResult, PatternEngine};
pub use crate::ledger::Ledger;
pub use crate::orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorParts, OrchestratorState};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::health::{HealthProbe, SyntheticProbe};
use crate::monitor::fetcher::{Fetcher, HttpFetcher};
use crate::monitor::scheduler::{spawn_source_tasks, BackoffCfg};
use crate::monitor::ChangeMonitor;
use crate::store::{JsonlStore, MemoryStore, VersionStore};
use crate::validate::corpus::{benchmark_corpus, CleanCorpus};
use crate::validate::cost::BenchmarkEstimator;
use crate::validate::{PipelineSettings, ValidationPipeline};

/// Build every component from configuration. `fetcher` defaults to HTTP.
pub fn assemble(cfg: &AutoUpdateConfig, fetcher: Option<Arc<dyn Fetcher>>) -> Result<OrchestratorParts> {
    let store: Arc<dyn VersionStore> = match &cfg.store_dir {
        Some(dir) => Arc::new(
            JsonlStore::open(dir)
                .with_context(|| format!("opening version store in {}", dir.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let ledger = Arc::new(Ledger::open(store).context("replaying version history")?);

    let head = ledger.head();
    let initial = PatternEngine::load_snapshot(&head)
        .with_context(|| format!("building snapshot for {}", head.id))?;
    let engine = Arc::new(PatternEngine::new(initial));

    let fetcher = match fetcher {
        Some(f) => f,
        None => Arc::new(HttpFetcher::new(cfg.fetch_timeout()).context("building HTTP client")?),
    };
    let mut monitor = ChangeMonitor::new(fetcher, &cfg.sources, cfg.fetch_timeout());
    if let Some(path) = &cfg.fingerprint_state_path {
        monitor = monitor.with_state_file(path.clone());
    }

    let corpus = Arc::new(match &cfg.clean_corpus_path {
        Some(path) => CleanCorpus::load_from(path)?,
        None => CleanCorpus::default_seed(),
    });
    let estimator = Arc::new(BenchmarkEstimator::new(benchmark_corpus(&corpus)));
    let pipeline = ValidationPipeline::new(PipelineSettings::from_config(cfg), Arc::clone(&corpus), estimator);
    let probe: Arc<dyn HealthProbe> = Arc::new(SyntheticProbe::from_corpus(&corpus));

    info!(
        target: "orchestrator",
        head = head.id.0,
        patterns = head.pattern_count(),
        sources = cfg.sources.len(),
        "components assembled"
    );
    Ok(OrchestratorParts {
        config: cfg.clone(),
        ledger,
        engine,
        monitor: Arc::new(monitor),
        pipeline,
        probe,
    })
}

/// Background tasks of a started pipeline.
pub struct Running {
    pub handle: OrchestratorHandle,
    pub stop: watch::Sender<bool>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Running {
    /// Signal every task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for t in self.tasks {
            let _ = t.await;
        }
    }
}

/// Spawn one poll task per source plus the orchestrator loop.
pub fn start(parts: OrchestratorParts) -> Running {
    let cfg = parts.config.clone();
    let monitor = Arc::clone(&parts.monitor);
    let (tx, rx) = mpsc::channel(cfg.channel_capacity);
    let (stop_tx, stop_rx) = watch::channel(false);

    let (orchestrator, handle) = Orchestrator::new(parts, rx, stop_rx.clone());
    let mut tasks = spawn_source_tasks(monitor, &cfg, BackoffCfg::from_config(&cfg), tx, stop_rx);
    tasks.push(tokio::spawn(orchestrator.run()));

    Running {
        handle,
        stop: stop_tx,
        tasks,
    }
}
