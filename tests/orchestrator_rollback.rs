// tests/orchestrator_rollback.rs
//
// Health-driven rollback, rollback limits and emergency stop.
// Health samples come from a scripted probe; the baseline is pinned at 100µs
// and the performance threshold is the default 2x.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use pixeltrace_autoupdate::config::AutoUpdateConfig;
use pixeltrace_autoupdate::engine::{EngineHandle, PatternEngine};
use pixeltrace_autoupdate::error::{CycleError, StoreError};
use pixeltrace_autoupdate::health::{HealthProbe, HealthSample, SampleShape, ScriptedProbe};
use pixeltrace_autoupdate::ledger::Ledger;
use pixeltrace_autoupdate::model::{Origin, Priority, RejectionRecord, SourceConfig, VersionId};
use pixeltrace_autoupdate::monitor::fetcher::ScriptedFetcher;
use pixeltrace_autoupdate::monitor::{fingerprint, ChangeMonitor, RawContent};
use pixeltrace_autoupdate::orchestrator::{
    CycleOutcome, Orchestrator, OrchestratorHandle, OrchestratorParts, OrchestratorState,
};
use pixeltrace_autoupdate::store::{MemoryStore, StoredState, VersionRecord, VersionStore};
use pixeltrace_autoupdate::validate::corpus::CleanCorpus;
use pixeltrace_autoupdate::validate::cost::FixedCost;
use pixeltrace_autoupdate::validate::{PipelineSettings, ValidationPipeline};

const HEALTH_INTERVAL: Duration = Duration::from_millis(30);

struct Rig {
    orchestrator: Orchestrator,
    handle: OrchestratorHandle,
    probe: Arc<ScriptedProbe>,
    ledger: Arc<Ledger>,
    engine: Arc<PatternEngine>,
    monitor: Arc<ChangeMonitor>,
    stop: watch::Sender<bool>,
    _tx: mpsc::Sender<RawContent>,
}

fn rig_with(cfg: AutoUpdateConfig) -> Rig {
    let scripted = Arc::new(ScriptedProbe::new(SampleShape::latency(100.0)));
    rig_on(cfg, Arc::new(Ledger::in_memory()), scripted.clone(), scripted)
}

fn rig_on(
    cfg: AutoUpdateConfig,
    ledger: Arc<Ledger>,
    probe: Arc<ScriptedProbe>,
    health: Arc<dyn HealthProbe>,
) -> Rig {
    let cfg = AutoUpdateConfig {
        health_samples_per_window: 3,
        sources: vec![SourceConfig {
            name: "A".into(),
            url: "https://feeds.invalid/a.txt".into(),
            priority: Priority::High,
            poll_interval_secs: None,
        }],
        ..cfg
    };
    let monitor = Arc::new(ChangeMonitor::new(
        Arc::new(ScriptedFetcher::new()),
        &cfg.sources,
        Duration::from_secs(2),
    ));
    let engine = Arc::new(PatternEngine::default());
    let pipeline = ValidationPipeline::new(
        PipelineSettings::from_config(&cfg),
        Arc::new(CleanCorpus::default_seed()),
        Arc::new(FixedCost::new(1.0)),
    );
    let parts = OrchestratorParts {
        config: cfg,
        ledger: ledger.clone(),
        engine: engine.clone(),
        monitor: monitor.clone(),
        pipeline,
        probe: health,
    };
    let (tx, rx) = mpsc::channel(8);
    let (stop, stop_rx) = watch::channel(false);
    let (orchestrator, handle) = Orchestrator::new(parts, rx, stop_rx);
    Rig {
        orchestrator: orchestrator
            .with_baseline(100.0)
            .with_health_interval(HEALTH_INTERVAL),
        handle,
        probe,
        ledger,
        engine,
        monitor,
        stop,
        _tx: tx,
    }
}

fn rig() -> Rig {
    rig_with(AutoUpdateConfig::default())
}

fn delivery(body: &str) -> RawContent {
    RawContent {
        source: "A".into(),
        priority: Priority::High,
        body: body.into(),
        fingerprint: fingerprint(body),
        etag: None,
    }
}

fn slow_window(rig: &Rig) {
    rig.probe.push_n(3, SampleShape::latency(300.0));
}

#[tokio::test]
async fn latency_regression_reverts_to_parent_within_one_interval() {
    let mut rig = rig();
    let good = rig.orchestrator.process(vec![delivery("good.tracker.example\n")]).await.unwrap();
    let CycleOutcome::Committed { version: good_v, .. } = good else {
        panic!("expected commit, got {good:?}");
    };

    slow_window(&rig);
    let started = std::time::Instant::now();
    let outcome = rig
        .orchestrator
        .process(vec![delivery("good.tracker.example\nslow.tracker.example\n")])
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let CycleOutcome::RolledBack { reverted, restored, rollback, emergency } = outcome else {
        panic!("expected rollback, got {outcome:?}");
    };
    assert_eq!(restored, good_v);
    assert_eq!(reverted, good_v.next());
    assert!(!emergency);
    assert!(elapsed < HEALTH_INTERVAL + Duration::from_millis(500), "rollback took {elapsed:?}");

    let head = rig.ledger.head();
    assert_eq!(head.id, rollback);
    assert_eq!(head.origin, Origin::Rollback);
    assert_eq!(head.reverts, Some(reverted));
    assert_eq!(head.restores, Some(good_v));
    assert_eq!(head.patterns, rig.ledger.get(good_v).unwrap().patterns);

    assert_eq!(rig.engine.active_version(), rollback);
    assert!(rig.engine.lookup("slow.tracker.example").is_none());
    assert!(rig.engine.lookup("good.tracker.example").is_some());

    let status = rig.handle.status();
    assert_eq!(status.state, OrchestratorState::Idle);
    assert_eq!(status.rollback_attempts, 1);
    assert!(!status.last_health.unwrap().healthy);
}

#[tokio::test]
async fn single_outlier_sample_does_not_roll_back() {
    let mut rig = rig();
    rig.probe.push(SampleShape::latency(100.0));
    rig.probe.push(SampleShape::latency(900.0));
    rig.probe.push(SampleShape::latency(110.0));
    let outcome = rig.orchestrator.process(vec![delivery("a.tracker.example\n")]).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Committed { healthy: true, .. }));
    assert_eq!(rig.ledger.head().origin, Origin::AutoUpdate);
}

#[tokio::test]
async fn third_rollback_enters_emergency_stop_until_cleared() {
    let mut rig = rig();
    for i in 0..3 {
        slow_window(&rig);
        let body = format!("bad{i}.tracker.example\n");
        let outcome = rig.orchestrator.process(vec![delivery(&body)]).await.unwrap();
        let CycleOutcome::RolledBack { emergency, .. } = outcome else {
            panic!("cycle {i}: expected rollback, got {outcome:?}");
        };
        assert_eq!(emergency, i == 2, "cycle {i}");
    }
    assert_eq!(rig.handle.state(), OrchestratorState::EmergencyStopped);
    let status = rig.handle.status();
    assert!(status.emergency_reason.is_some());
    assert_eq!(status.rollback_attempts, 3);

    let head_before = rig.ledger.head_id();
    let ignored = rig
        .orchestrator
        .process(vec![delivery("new.tracker.example\n")])
        .await
        .unwrap();
    assert!(matches!(ignored, CycleOutcome::Ignored { .. }));
    assert_eq!(rig.ledger.head_id(), head_before);

    assert!(rig.handle.clear_emergency());
    assert_eq!(rig.handle.state(), OrchestratorState::Idle);
    let outcome = rig
        .orchestrator
        .process(vec![delivery("new.tracker.example\n")])
        .await
        .unwrap();
    assert!(matches!(outcome, CycleOutcome::Committed { healthy: true, .. }));
    assert_eq!(rig.handle.status().rollback_attempts, 0);
}

#[tokio::test]
async fn manual_emergency_stop_halts_cycles() {
    let mut rig = rig();
    rig.handle.emergency_stop("operator");
    let outcome = rig.orchestrator.process(vec![delivery("x.tracker.example\n")]).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Ignored {
            reason: "emergency stop: operator".into()
        }
    );
    assert_eq!(rig.ledger.head_id(), VersionId::ROOT);
}

#[tokio::test]
async fn configured_emergency_flag_starts_stopped() {
    let rig = rig_with(AutoUpdateConfig {
        emergency_stop: true,
        ..AutoUpdateConfig::default()
    });
    assert_eq!(rig.handle.state(), OrchestratorState::EmergencyStopped);
}

#[tokio::test]
async fn disabled_auto_update_ignores_deliveries() {
    let mut rig = rig_with(AutoUpdateConfig {
        auto_update_enabled: false,
        ..AutoUpdateConfig::default()
    });
    let outcome = rig.orchestrator.process(vec![delivery("x.tracker.example\n")]).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Ignored { .. }));
    assert_eq!(rig.handle.state(), OrchestratorState::Idle);
}

#[tokio::test]
async fn breach_without_auto_rollback_keeps_version() {
    let mut rig = rig_with(AutoUpdateConfig {
        auto_rollback: false,
        ..AutoUpdateConfig::default()
    });
    slow_window(&rig);
    let outcome = rig.orchestrator.process(vec![delivery("x.tracker.example\n")]).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Committed { healthy: false, .. }));
    assert_eq!(rig.engine.active_version(), rig.ledger.head_id());
    assert!(rig.engine.previous().is_none());
}

#[tokio::test]
async fn manual_rollback_restores_any_version() {
    let mut rig = rig();
    rig.orchestrator.process(vec![delivery("one.tracker.example\n")]).await.unwrap();
    rig.orchestrator
        .process(vec![delivery("one.tracker.example\ntwo.tracker.example\n")])
        .await
        .unwrap();
    assert_eq!(rig.engine.current().pattern_count(), 2);

    let id = rig.orchestrator.manual_rollback(VersionId(1)).unwrap();
    assert_eq!(rig.engine.active_version(), id);
    assert_eq!(rig.engine.current().pattern_count(), 1);
    assert_eq!(rig.handle.state(), OrchestratorState::Idle);

    let err = rig.orchestrator.manual_rollback(VersionId(99)).unwrap_err();
    assert!(matches!(err, CycleError::RollbackTargetMissing(VersionId(99))));
}

#[tokio::test]
async fn stop_signal_aborts_between_states() {
    let mut rig = rig();
    rig.stop.send(true).unwrap();
    let err = rig
        .orchestrator
        .process(vec![delivery("x.tracker.example\n")])
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::Stopped));
    assert_eq!(rig.handle.state(), OrchestratorState::Idle);
    assert_eq!(rig.ledger.head_id(), VersionId::ROOT);
}

/// Raises an emergency stop from inside the next version write.
struct StopDuringCommit {
    inner: MemoryStore,
    handle: Mutex<Option<OrchestratorHandle>>,
}

impl VersionStore for StopDuringCommit {
    fn load(&self) -> Result<StoredState, StoreError> {
        self.inner.load()
    }

    fn append_version(&self, record: &VersionRecord) -> Result<(), StoreError> {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.emergency_stop("operator during commit");
        }
        self.inner.append_version(record)
    }

    fn append_rejections(&self, records: &[RejectionRecord]) -> Result<(), StoreError> {
        self.inner.append_rejections(records)
    }
}

#[tokio::test]
async fn emergency_during_commit_leaves_head_on_live_content() {
    let store = Arc::new(StopDuringCommit {
        inner: MemoryStore::new(),
        handle: Mutex::new(None),
    });
    let ledger = Arc::new(Ledger::open(store.clone()).unwrap());
    let scripted = Arc::new(ScriptedProbe::new(SampleShape::latency(100.0)));
    let mut rig = rig_on(AutoUpdateConfig::default(), ledger, scripted.clone(), scripted);
    *store.handle.lock().unwrap() = Some(rig.handle.clone());

    let err = rig
        .orchestrator
        .process(vec![delivery("late.tracker.example\n")])
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::EmergencyStop(_)), "{err:?}");

    let head = rig.ledger.head();
    assert_eq!(rig.engine.active_version(), head.id);
    assert_eq!(head.origin, Origin::Rollback);
    assert!(head.patterns.is_empty());
    assert!(rig.engine.lookup("late.tracker.example").is_none());
    let status = rig.handle.status();
    assert_eq!(status.state, OrchestratorState::EmergencyStopped);
    assert_eq!(status.head_version, status.active_version);
    assert_eq!(status.rollback_attempts, 0);
    // never acknowledged, so the content is offered again after the stop clears
    assert!(rig.monitor.committed("A").is_none());

    assert!(rig.handle.clear_emergency());
    let outcome = rig
        .orchestrator
        .process(vec![delivery("late.tracker.example\n")])
        .await
        .unwrap();
    assert!(matches!(outcome, CycleOutcome::Committed { healthy: true, .. }));
    assert!(rig.engine.lookup("late.tracker.example").is_some());
}

/// Scripted samples; raises an emergency stop on the first sample once armed.
struct StopDuringHealth {
    inner: Arc<ScriptedProbe>,
    handle: Mutex<Option<OrchestratorHandle>>,
}

#[async_trait]
impl HealthProbe for StopDuringHealth {
    async fn sample(&self, engine: &EngineHandle) -> HealthSample {
        let armed = self.handle.lock().unwrap().take();
        if let Some(handle) = armed {
            handle.emergency_stop("operator during health check");
        }
        self.inner.sample(engine).await
    }
}

#[tokio::test]
async fn emergency_during_health_check_withdraws_the_unverified_version() {
    let scripted = Arc::new(ScriptedProbe::new(SampleShape::latency(100.0)));
    let health = Arc::new(StopDuringHealth {
        inner: scripted.clone(),
        handle: Mutex::new(None),
    });
    let mut rig = rig_on(
        AutoUpdateConfig::default(),
        Arc::new(Ledger::in_memory()),
        scripted,
        health.clone(),
    );
    let first = rig.orchestrator.process(vec![delivery("one.tracker.example\n")]).await.unwrap();
    let CycleOutcome::Committed { version: good, healthy: true, .. } = first else {
        panic!("expected healthy commit, got {first:?}");
    };

    *health.handle.lock().unwrap() = Some(rig.handle.clone());
    let err = rig
        .orchestrator
        .process(vec![delivery("one.tracker.example\ntwo.tracker.example\n")])
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::EmergencyStop(_)), "{err:?}");

    let head = rig.ledger.head();
    assert_eq!(head.origin, Origin::Rollback);
    assert_eq!(head.reverts, Some(good.next()));
    assert_eq!(head.restores, Some(good));
    assert_eq!(rig.engine.active_version(), head.id);
    assert!(rig.engine.lookup("two.tracker.example").is_none());
    assert!(rig.engine.lookup("one.tracker.example").is_some());
    assert!(rig.engine.previous().is_none());
    assert_eq!(rig.handle.status().rollback_attempts, 0);
    assert_eq!(rig.handle.state(), OrchestratorState::EmergencyStopped);
}
