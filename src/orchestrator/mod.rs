// src/orchestrator/mod.rs
//! # Orchestrator
//! Serialized lifecycle driver wiring monitor, pipeline, ledger and engine.
//!
//! One cycle runs at a time: sync → validate → commit → hot reload → health
//! check, then back to idle or through a rollback. Deliveries that arrive
//! mid-cycle wait in the channel and are folded into the next cycle, latest
//! content per source winning.
//!
//! Emergency stop is shared state checked at every transition, so it takes
//! effect on the next state change of a running cycle and refuses new ones.
//! The cooperative stop signal is checked between states.

pub mod plan;
pub mod state;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::AutoUpdateConfig;
use crate::engine::PatternEngine;
use crate::error::{CycleError, LedgerError};
use crate::health::{evaluate, HealthProbe, HealthThresholds, HealthVerdict, HealthWindow, MIN_WINDOW_SAMPLES};
use crate::ledger::Ledger;
use crate::model::{Origin, PatternKey, Priority, VersionId};
use crate::monitor::{ChangeMonitor, RawContent, SourceStatus};
use crate::parse::parse_feed;
use crate::rollback_guard::RollbackGuard;
use crate::validate::{ValidationPipeline, ValidationResult};

pub use plan::{plan_delta, Delivery, DeltaPlan, Resolution};
pub use state::OrchestratorState;

/// Re-plans after a commit conflict before the cycle gives up.
pub const MAX_COMMIT_RETRIES: usize = 3;
const COMMAND_CAPACITY: usize = 16;
/// Weight of the newest healthy window in the latency baseline.
const BASELINE_SMOOTHING: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    NoChange {
        rejected: usize,
    },
    Committed {
        version: VersionId,
        accepted: usize,
        rejected: usize,
        healthy: bool,
    },
    RolledBack {
        reverted: VersionId,
        restored: VersionId,
        rollback: VersionId,
        emergency: bool,
    },
    /// Deliveries dropped without running a cycle.
    Ignored {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub at: DateTime<Utc>,
    pub outcome: Option<CycleOutcome>,
    pub error: Option<String>,
}

/// Point-in-time view for the status query.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: OrchestratorState,
    pub active_version: VersionId,
    pub head_version: VersionId,
    pub pattern_count: usize,
    pub auto_update_enabled: bool,
    pub last_health: Option<HealthVerdict>,
    pub last_cycle: Option<CycleSummary>,
    pub rollback_attempts: u32,
    pub max_rollback_attempts: u32,
    pub emergency_reason: Option<String>,
    pub sources: Vec<SourceStatus>,
}

enum Command {
    Rollback {
        target: VersionId,
        reply: oneshot::Sender<Result<VersionId, CycleError>>,
    },
}

enum Trigger {
    Deliveries(Vec<RawContent>),
    Refresh,
}

/// State readable from outside the driver task.
struct Shared {
    state: RwLock<OrchestratorState>,
    emergency: RwLock<Option<String>>,
    guard: Mutex<RollbackGuard>,
    last_health: RwLock<Option<HealthVerdict>>,
    last_cycle: RwLock<Option<CycleSummary>>,
}

impl Shared {
    fn state(&self) -> OrchestratorState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn emergency_reason(&self) -> Option<String> {
        self.emergency.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Move to `to`; refused while an emergency stop is active.
    fn transition(&self, to: OrchestratorState) -> Result<(), CycleError> {
        let mut st = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(reason) = self.emergency_reason() {
            return Err(CycleError::EmergencyStop(reason));
        }
        if !st.can_transition(to) {
            tracing::warn!(target: "orchestrator", from = %*st, to = %to, "unexpected state transition");
        }
        tracing::info!(target: "orchestrator", from = %*st, to = %to, "state transition");
        *st = to;
        Ok(())
    }

    /// Back to idle after an aborted cycle, unless stopped.
    fn settle(&self) {
        let mut st = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *st != OrchestratorState::EmergencyStopped && *st != OrchestratorState::Idle {
            tracing::info!(target: "orchestrator", from = %*st, to = "idle", "cycle aborted");
            *st = OrchestratorState::Idle;
        }
    }

    fn enter_emergency(&self, reason: String) {
        let mut st = self.state.write().unwrap_or_else(|e| e.into_inner());
        *self.emergency.write().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());
        tracing::error!(target: "orchestrator", from = %*st, reason = %reason, "emergency stop");
        *st = OrchestratorState::EmergencyStopped;
    }

    fn clear_emergency(&self) -> bool {
        let mut st = self.state.write().unwrap_or_else(|e| e.into_inner());
        let was = self.emergency.write().unwrap_or_else(|e| e.into_inner()).take();
        self.guard.lock().unwrap_or_else(|e| e.into_inner()).reset();
        if *st == OrchestratorState::EmergencyStopped {
            *st = OrchestratorState::Idle;
        }
        if was.is_some() {
            tracing::warn!(target: "orchestrator", "emergency stop cleared");
        }
        was.is_some()
    }

    fn record_rollback_attempt(&self, now: DateTime<Utc>) -> u32 {
        self.guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_attempt(now)
    }

    fn rollbacks_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.guard.lock().unwrap_or_else(|e| e.into_inner()).exhausted(now)
    }

    fn rollback_attempts(&self, now: DateTime<Utc>) -> u32 {
        self.guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attempts_in_window(now)
    }

    fn set_health(&self, verdict: HealthVerdict) {
        *self.last_health.write().unwrap_or_else(|e| e.into_inner()) = Some(verdict);
    }

    fn record_cycle(&self, result: &Result<CycleOutcome, CycleError>) {
        let summary = CycleSummary {
            at: Utc::now(),
            outcome: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        *self.last_cycle.write().unwrap_or_else(|e| e.into_inner()) = Some(summary);
    }
}

/// Everything the driver needs, bundled for construction.
pub struct OrchestratorParts {
    pub config: AutoUpdateConfig,
    pub ledger: Arc<Ledger>,
    pub engine: Arc<PatternEngine>,
    pub monitor: Arc<ChangeMonitor>,
    pub pipeline: ValidationPipeline,
    pub probe: Arc<dyn HealthProbe>,
}

/// Cloneable control surface for the API and the binary.
#[derive(Clone)]
pub struct OrchestratorHandle {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    ledger: Arc<Ledger>,
    engine: Arc<PatternEngine>,
    monitor: Arc<ChangeMonitor>,
    auto_update_enabled: bool,
}

impl OrchestratorHandle {
    pub fn state(&self) -> OrchestratorState {
        self.shared.state()
    }

    pub fn status(&self) -> StatusReport {
        let active = self.engine.current();
        let guard_max = self
            .shared
            .guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .max_attempts();
        StatusReport {
            state: self.shared.state(),
            active_version: active.version(),
            head_version: self.ledger.head_id(),
            pattern_count: active.pattern_count(),
            auto_update_enabled: self.auto_update_enabled,
            last_health: self
                .shared
                .last_health
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            last_cycle: self
                .shared
                .last_cycle
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            rollback_attempts: self.shared.rollback_attempts(Utc::now()),
            max_rollback_attempts: guard_max,
            emergency_reason: self.shared.emergency_reason(),
            sources: self.monitor.status(),
        }
    }

    /// Halt automatic updates immediately.
    pub fn emergency_stop(&self, reason: impl Into<String>) {
        self.shared.enter_emergency(reason.into());
    }

    /// Returns whether an emergency stop was active.
    pub fn clear_emergency(&self) -> bool {
        self.shared.clear_emergency()
    }

    /// Manual rollback, executed by the driver between cycles.
    pub async fn rollback(&self, target: VersionId) -> Result<VersionId, CycleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Rollback { target, reply })
            .await
            .map_err(|_| CycleError::Stopped)?;
        rx.await.map_err(|_| CycleError::Stopped)?
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn engine(&self) -> &Arc<PatternEngine> {
        &self.engine
    }
}

pub struct Orchestrator {
    cfg: AutoUpdateConfig,
    ledger: Arc<Ledger>,
    engine: Arc<PatternEngine>,
    monitor: Arc<ChangeMonitor>,
    pipeline: ValidationPipeline,
    probe: Arc<dyn HealthProbe>,
    shared: Arc<Shared>,
    thresholds: HealthThresholds,
    window: HealthWindow,
    baseline_us: Option<f64>,
    health_interval: Duration,
    deliveries: mpsc::Receiver<RawContent>,
    commands: mpsc::Receiver<Command>,
    stop: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        parts: OrchestratorParts,
        deliveries: mpsc::Receiver<RawContent>,
        stop: watch::Receiver<bool>,
    ) -> (Self, OrchestratorHandle) {
        let OrchestratorParts {
            config,
            ledger,
            engine,
            monitor,
            pipeline,
            probe,
        } = parts;
        let shared = Arc::new(Shared {
            state: RwLock::new(OrchestratorState::Idle),
            emergency: RwLock::new(None),
            guard: Mutex::new(RollbackGuard::new(
                config.max_rollback_attempts,
                config.rollback_window(),
            )),
            last_health: RwLock::new(None),
            last_cycle: RwLock::new(None),
        });
        if config.emergency_stop {
            shared.enter_emergency("emergency_stop set in configuration".into());
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = OrchestratorHandle {
            shared: Arc::clone(&shared),
            commands: cmd_tx,
            ledger: Arc::clone(&ledger),
            engine: Arc::clone(&engine),
            monitor: Arc::clone(&monitor),
            auto_update_enabled: config.auto_update_enabled,
        };
        let samples = config.health_samples_per_window.max(MIN_WINDOW_SAMPLES);
        let orchestrator = Self {
            thresholds: HealthThresholds::from_config(&config),
            window: HealthWindow::with_capacity(samples * 4),
            baseline_us: None,
            health_interval: config.health_check_interval(),
            cfg: config,
            ledger,
            engine,
            monitor,
            pipeline,
            probe,
            shared,
            deliveries,
            commands: cmd_rx,
            stop,
        };
        (orchestrator, handle)
    }

    /// Override the span of one health window.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Fix the latency baseline instead of sampling it at start.
    pub fn with_baseline(mut self, latency_us: f64) -> Self {
        self.baseline_us = Some(latency_us);
        self
    }

    pub fn baseline_us(&self) -> Option<f64> {
        self.baseline_us
    }

    /// Drive cycles until the stop signal fires or the delivery channel closes.
    pub async fn run(mut self) {
        if self.baseline_us.is_none() {
            self.establish_baseline().await;
        }
        let mut refresh = tokio::time::interval(self.cfg.pattern_refresh_interval());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;
        tracing::info!(target: "orchestrator", baseline_us = ?self.baseline_us, "orchestrator started");

        loop {
            tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                }
                Some(cmd) = self.commands.recv() => self.handle_command(cmd),
                raw = self.deliveries.recv() => {
                    let Some(first) = raw else { break };
                    let mut batch = vec![first];
                    while let Ok(more) = self.deliveries.try_recv() {
                        batch.push(more);
                    }
                    let _ = self.process(batch).await;
                }
                _ = refresh.tick() => {
                    let _ = self.refresh().await;
                }
            }
        }
        tracing::info!(target: "orchestrator", "orchestrator stopped");
    }

    /// One cycle over already-fetched content.
    pub async fn process(&mut self, batch: Vec<RawContent>) -> Result<CycleOutcome, CycleError> {
        self.drive(Trigger::Deliveries(batch)).await
    }

    /// One cycle that polls every source first.
    pub async fn refresh(&mut self) -> Result<CycleOutcome, CycleError> {
        self.drive(Trigger::Refresh).await
    }

    async fn drive(&mut self, trigger: Trigger) -> Result<CycleOutcome, CycleError> {
        let result = self.cycle(trigger).await;
        if let Err(e) = &result {
            tracing::warn!(target: "orchestrator", "cycle aborted: {e}");
            self.shared.settle();
        }
        self.shared.record_cycle(&result);
        result
    }

    async fn cycle(&mut self, trigger: Trigger) -> Result<CycleOutcome, CycleError> {
        if let Some(reason) = self.shared.emergency_reason() {
            tracing::debug!(target: "orchestrator", "emergency stop active, cycle skipped");
            return Ok(CycleOutcome::Ignored {
                reason: format!("emergency stop: {reason}"),
            });
        }
        if !self.cfg.auto_update_enabled {
            return Ok(CycleOutcome::Ignored {
                reason: "auto update disabled".into(),
            });
        }
        counter!("autoupdate_cycles_total").increment(1);
        self.shared.transition(OrchestratorState::Syncing)?;

        let mut contents = match trigger {
            Trigger::Deliveries(batch) => batch,
            Trigger::Refresh => self.poll_all().await,
        };
        while let Ok(more) = self.deliveries.try_recv() {
            contents.push(more);
        }
        if contents.is_empty() {
            self.shared.transition(OrchestratorState::Idle)?;
            return Ok(CycleOutcome::NoChange { rejected: 0 });
        }
        self.sync(fold_latest(contents)).await
    }

    async fn poll_all(&self) -> Vec<RawContent> {
        let mut set = JoinSet::new();
        for name in self.monitor.source_names() {
            let monitor = Arc::clone(&self.monitor);
            let name = name.clone();
            set.spawn(async move {
                let res = monitor.poll(&name).await;
                (name, res)
            });
        }
        let mut out = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(Some(raw)))) => out.push(raw),
                Ok((_, Ok(None))) => {}
                Ok((name, Err(e))) => {
                    counter!("autoupdate_fetch_errors_total").increment(1);
                    tracing::warn!(target: "orchestrator", source = %name, "refresh fetch failed: {e}");
                }
                Err(e) => tracing::error!(target: "orchestrator", "poll task lost: {e}"),
            }
        }
        out
    }

    fn priority_of(&self, source: &str) -> Priority {
        self.monitor
            .source(source)
            .map(|s| s.priority)
            .unwrap_or(Priority::Low)
    }

    fn check_interrupt(&self) -> Result<(), CycleError> {
        if *self.stop.borrow() {
            return Err(CycleError::Stopped);
        }
        if let Some(reason) = self.shared.emergency_reason() {
            return Err(CycleError::EmergencyStop(reason));
        }
        Ok(())
    }

    async fn sync(&mut self, contents: Vec<RawContent>) -> Result<CycleOutcome, CycleError> {
        let deliveries: Vec<Delivery> = contents
            .iter()
            .map(|raw| Delivery {
                source: raw.source.clone(),
                priority: raw.priority,
                candidates: parse_feed(&raw.source, &raw.body),
            })
            .collect();
        tracing::info!(
            target: "orchestrator",
            sources = deliveries.len(),
            candidates = deliveries.iter().map(|d| d.candidates.len()).sum::<usize>(),
            "content parsed"
        );
        self.check_interrupt()?;
        self.shared.transition(OrchestratorState::Validating)?;
        self.pipeline.set_snapshot_size(self.engine.current().regex_count());

        let mut cache: HashMap<PatternKey, ValidationResult> = HashMap::new();
        let mut rejections_recorded = false;
        let mut conflicts = 0;
        let (version, accepted, rejected) = loop {
            let head = self.ledger.head();
            let plan = plan_delta(
                &head,
                &deliveries,
                |s| self.priority_of(s),
                |p| self.pipeline.confidence(p),
            );
            let pending = plan.pending(&cache);
            if !pending.is_empty() {
                for r in self.pipeline.validate_batch(pending).await {
                    cache.insert(r.key(), r);
                }
            }
            let res = plan.resolve(&cache);
            if !rejections_recorded {
                self.record_rejections(&contents, &res)?;
                rejections_recorded = true;
            }

            if res.delta.is_empty() {
                self.shared.transition(OrchestratorState::Idle)?;
                if res.rejected.is_empty() {
                    self.acknowledge(&contents).await;
                }
                return Ok(CycleOutcome::NoChange {
                    rejected: res.rejected.len(),
                });
            }

            self.check_interrupt()?;
            self.shared.transition(OrchestratorState::Committing)?;
            let message = commit_message(&contents, &res);
            match self.ledger.commit(&res.delta, message, Origin::AutoUpdate) {
                Ok(id) => break (id, res.accepted, res.rejected.len()),
                Err(LedgerError::Conflict { expected, head }) if conflicts < MAX_COMMIT_RETRIES => {
                    conflicts += 1;
                    tracing::warn!(
                        target: "orchestrator",
                        attempt = conflicts,
                        %expected,
                        %head,
                        "commit conflict, replanning"
                    );
                    self.shared.transition(OrchestratorState::Validating)?;
                }
                Err(e) => return Err(e.into()),
            }
        };

        counter!("autoupdate_commits_total").increment(1);
        self.reload(&contents, version, accepted, rejected).await
    }

    /// Log rejections once per source content. Content that keeps being
    /// re-delivered because it was never acknowledged is not logged again.
    fn record_rejections(&self, contents: &[RawContent], res: &Resolution) -> Result<(), CycleError> {
        if contents.iter().all(|raw| self.monitor.rejections_logged(raw)) {
            tracing::debug!(target: "orchestrator", "rejections for this content already recorded");
            return Ok(());
        }
        let now = Utc::now();
        let records: Vec<_> = res
            .rejected
            .iter()
            .filter_map(|r| r.rejection_record(now))
            .collect();
        self.ledger.record_rejections(&records)?;
        for raw in contents {
            self.monitor.mark_rejections_logged(raw);
        }
        Ok(())
    }

    async fn acknowledge(&self, contents: &[RawContent]) {
        for raw in contents {
            self.monitor.acknowledge(raw).await;
        }
    }

    /// Load the committed version and judge it. The fingerprints of
    /// `contents` are acknowledged once a verdict (or a deterministic
    /// build failure) is reached; an interrupted cycle leaves the head on
    /// the previously live content and the sources unacknowledged.
    async fn reload(
        &mut self,
        contents: &[RawContent],
        id: VersionId,
        accepted: usize,
        rejected: usize,
    ) -> Result<CycleOutcome, CycleError> {
        if let Err(e) = self.shared.transition(OrchestratorState::HotReloading) {
            tracing::warn!(target: "orchestrator", version = id.0, "reload refused: {e}");
            self.realign_head();
            return Err(e);
        }
        let version = match self.ledger.get(id) {
            Some(v) => v,
            None => {
                self.realign_head();
                return Err(LedgerError::NotFound(id).into());
            }
        };
        let handle = match PatternEngine::load_snapshot(&version) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(target: "orchestrator", version = id.0, "index build failed: {e}");
                self.realign_head();
                self.acknowledge(contents).await;
                return Err(e.into());
            }
        };
        self.engine.activate(handle);

        let checked = match self.shared.transition(OrchestratorState::HealthChecking) {
            Ok(()) => self.health_window(id).await,
            Err(e) => Err(e),
        };
        let verdict = match checked {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "orchestrator", version = id.0, "health check interrupted: {e}");
                self.abandon(id);
                return Err(e);
            }
        };
        self.shared.set_health(verdict.clone());
        self.acknowledge(contents).await;

        if verdict.healthy {
            self.update_baseline(verdict.median_latency_us);
            self.engine.release_previous();
            self.shared.transition(OrchestratorState::Idle)?;
            return Ok(CycleOutcome::Committed {
                version: id,
                accepted,
                rejected,
                healthy: true,
            });
        }

        tracing::warn!(
            target: "orchestrator",
            version = id.0,
            breaches = ?verdict.breaches,
            "health window breached"
        );
        if !self.cfg.auto_rollback {
            self.engine.release_previous();
            self.shared.transition(OrchestratorState::Idle)?;
            return Ok(CycleOutcome::Committed {
                version: id,
                accepted,
                rejected,
                healthy: false,
            });
        }
        if let Err(e) = self.shared.transition(OrchestratorState::RollingBack) {
            self.abandon(id);
            return Err(e);
        }
        self.auto_rollback(id)
    }

    /// Head stays equal to the live snapshot after a failed build.
    fn realign_head(&self) {
        let active = self.engine.current();
        match self.ledger.rollback(active.version()) {
            Ok(id) => {
                self.engine.activate(active.relabel(id));
                self.engine.release_previous();
            }
            Err(e) => {
                tracing::error!(target: "orchestrator", "could not realign ledger head: {e}")
            }
        }
    }

    /// Put the pre-commit snapshot back when `bad` never got a verdict.
    /// Not counted as a rollback attempt.
    fn abandon(&self, bad: VersionId) {
        match self.rollback_target(bad).and_then(|t| self.restore(t).map(|id| (t, id))) {
            Ok((target, id)) => {
                self.engine.release_previous();
                tracing::warn!(
                    target: "orchestrator",
                    abandoned = bad.0,
                    restored = target.0,
                    rollback = id.0,
                    "unverified version withdrawn"
                );
            }
            Err(e) => {
                tracing::error!(target: "orchestrator", version = bad.0, "could not withdraw unverified version: {e}")
            }
        }
    }

    async fn establish_baseline(&mut self) {
        let handle = self.engine.current();
        let mut samples = Vec::with_capacity(MIN_WINDOW_SAMPLES);
        for _ in 0..MIN_WINDOW_SAMPLES {
            samples.push(self.probe.sample(&handle).await);
        }
        self.baseline_us = evaluate(handle.version(), &samples, None, &self.thresholds)
            .map(|v| v.median_latency_us);
        tracing::info!(target: "health", baseline_us = ?self.baseline_us, "latency baseline established");
    }

    fn update_baseline(&mut self, observed_us: f64) {
        self.baseline_us = Some(match self.baseline_us {
            Some(b) => b * (1.0 - BASELINE_SMOOTHING) + observed_us * BASELINE_SMOOTHING,
            None => observed_us,
        });
    }

    /// Sample the active engine across one health interval.
    async fn health_window(&mut self, version: VersionId) -> Result<HealthVerdict, CycleError> {
        let planned = self.cfg.health_samples_per_window.max(MIN_WINDOW_SAMPLES);
        let spacing = self.health_interval / planned as u32;
        let handle = self.engine.current();

        for i in 0..planned {
            if i > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(spacing) => {}
                    _ = self.stop.changed() => {}
                }
            }
            self.check_interrupt()?;
            let sample = self.probe.sample(&handle).await;
            tracing::debug!(
                target: "health",
                version = version.0,
                latency_us = sample.latency_us,
                false_positives = sample.false_positives,
                errors = sample.errors,
                "health sample"
            );
            self.window.record(sample);

            // stop early once a majority of the planned window has breached
            let samples = self.window.samples_for(version);
            let breached = samples
                .iter()
                .filter(|s| self.thresholds.sample_breaches(s, self.baseline_us))
                .count();
            if breached * 2 > planned {
                if let Some(v) = evaluate(version, &samples, self.baseline_us, &self.thresholds) {
                    if !v.healthy {
                        return Ok(v);
                    }
                }
            }
        }

        let samples = self.window.samples_for(version);
        evaluate(version, &samples, self.baseline_us, &self.thresholds).ok_or(CycleError::Stopped)
    }

    fn rollback_target(&self, bad: VersionId) -> Result<VersionId, CycleError> {
        self.engine
            .previous()
            .map(|h| h.version())
            .or_else(|| self.ledger.get(bad).and_then(|v| v.parent))
            .ok_or(CycleError::RollbackTargetMissing(bad))
    }

    fn auto_rollback(&mut self, bad: VersionId) -> Result<CycleOutcome, CycleError> {
        let now = Utc::now();
        let attempts = self.shared.record_rollback_attempt(now);
        counter!("autoupdate_rollbacks_total").increment(1);

        let restored = self.rollback_target(bad).and_then(|t| self.restore(t).map(|id| (t, id)));
        let exhausted = self.shared.rollbacks_exhausted(now);
        let window = self.cfg.rollback_window_seconds;

        match restored {
            Ok((target, id)) => {
                self.engine.release_previous();
                tracing::warn!(
                    target: "orchestrator",
                    reverted = bad.0,
                    restored = target.0,
                    rollback = id.0,
                    attempts,
                    "rolled back"
                );
                if exhausted {
                    self.shared.enter_emergency(format!(
                        "{attempts} rollback attempts within {window}s"
                    ));
                } else {
                    self.shared.transition(OrchestratorState::Idle)?;
                }
                Ok(CycleOutcome::RolledBack {
                    reverted: bad,
                    restored: target,
                    rollback: id,
                    emergency: exhausted,
                })
            }
            Err(e) => {
                tracing::error!(target: "orchestrator", version = bad.0, attempts, "rollback failed: {e}");
                if exhausted {
                    self.shared
                        .enter_emergency(format!("rollback failing after {attempts} attempts: {e}"));
                }
                Err(e)
            }
        }
    }

    /// Commit a rollback to `target` and activate its content.
    fn restore(&self, target: VersionId) -> Result<VersionId, CycleError> {
        if self.ledger.get(target).is_none() {
            return Err(CycleError::RollbackTargetMissing(target));
        }
        let id = self.ledger.rollback(target)?;
        let handle = match self.engine.previous() {
            Some(prev) if prev.version() == target => prev.relabel(id),
            _ => {
                let version = self.ledger.get(id).ok_or(LedgerError::NotFound(id))?;
                PatternEngine::load_snapshot(&version)?
            }
        };
        self.engine.activate(handle);
        Ok(id)
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Rollback { target, reply } => {
                let res = self.manual_rollback(target);
                if let Err(e) = &res {
                    tracing::warn!(target: "orchestrator", target_version = target.0, "manual rollback failed: {e}");
                }
                let _ = reply.send(res);
            }
        }
    }

    /// Operator rollback; allowed during an emergency stop.
    pub fn manual_rollback(&mut self, target: VersionId) -> Result<VersionId, CycleError> {
        let stopped = self.shared.emergency_reason().is_some();
        if !stopped {
            self.shared.transition(OrchestratorState::RollingBack)?;
        }
        let res = self.restore(target);
        if !stopped {
            self.shared.settle();
        }
        res
    }
}

/// Latest content per source, in order of first arrival.
fn fold_latest(batch: Vec<RawContent>) -> Vec<RawContent> {
    let mut order = Vec::new();
    let mut latest: HashMap<String, RawContent> = HashMap::new();
    for raw in batch {
        if !latest.contains_key(&raw.source) {
            order.push(raw.source.clone());
        }
        latest.insert(raw.source.clone(), raw);
    }
    order.into_iter().filter_map(|s| latest.remove(&s)).collect()
}

fn commit_message(contents: &[RawContent], res: &Resolution) -> String {
    let sources: Vec<&str> = contents.iter().map(|c| c.source.as_str()).collect();
    let reattributed = res.delta.upserts.len() - res.accepted;
    format!(
        "auto-update from {}: +{} ~{} -{} ({} rejected)",
        sources.join(", "),
        res.accepted,
        reattributed,
        res.delta.removals.len(),
        res.rejected.len()
    )
}
