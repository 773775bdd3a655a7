// src/validate/mod.rs
//! # Validation Pipeline
//! Staged accept/reject decision for candidate patterns.
//!
//! Stages run cheapest first and stop at the first failure:
//! syntax → performance → false positive → community confidence.
//! A batch resolves only once every candidate has a terminal result.

pub mod confidence;
pub mod corpus;
pub mod cost;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::AutoUpdateConfig;
use crate::error::RejectionReason;
use crate::model::{
    PatternKey, PatternKind, PatternRecord, Priority, RejectionRecord, Stage, VersionId,
};
use crate::parse::normalize_domain;
use confidence::{fp_ceiling, ConfidenceWeights};
use corpus::CleanCorpus;
use cost::CostEstimator;

/// Compiled-program size ceiling for one pattern.
pub const REGEX_SIZE_LIMIT: usize = 1 << 20;
pub const MAX_PATTERN_LEN: usize = 1000;
pub const MAX_GROUPS: usize = 20;

/// Hosts that never make sense as a tracker rule.
const RESERVED_HOSTS: &[&str] = &["localhost", "localhost.localdomain", "example.com", "test.com"];

/// One distinct pattern of a cycle with every source that delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
    pub kind: PatternKind,
    pub pattern: String,
    pub sources: BTreeSet<String>,
    /// Priority tier of each delivering source.
    pub priorities: Vec<Priority>,
}

impl CandidateGroup {
    pub fn key(&self) -> PatternKey {
        PatternKey::new(self.kind, self.pattern.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub passed: bool,
    pub score: f64,
    pub elapsed_us: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub stage: Stage,
    pub score: f64,
    pub reason: RejectionReason,
}

/// Terminal outcome for one candidate. Immutable once produced.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub kind: PatternKind,
    pub pattern: String,
    pub sources: BTreeSet<String>,
    pub confidence: f32,
    pub stages: Vec<StageOutcome>,
    pub rejection: Option<Rejection>,
}

impl ValidationResult {
    fn start(c: &CandidateGroup, confidence: f32) -> Self {
        Self {
            kind: c.kind,
            pattern: c.pattern.clone(),
            sources: c.sources.clone(),
            confidence,
            stages: Vec::with_capacity(Stage::ALL.len()),
            rejection: None,
        }
    }

    pub fn accepted(&self) -> bool {
        self.rejection.is_none()
    }

    pub fn key(&self) -> PatternKey {
        PatternKey::new(self.kind, self.pattern.clone())
    }

    /// Record for the delta; `first_version` is stamped at commit.
    pub fn record(&self) -> Option<PatternRecord> {
        self.accepted().then(|| PatternRecord {
            kind: self.kind,
            pattern: self.pattern.clone(),
            sources: self.sources.clone(),
            confidence: self.confidence,
            first_version: VersionId::ROOT,
        })
    }

    pub fn rejection_record(&self, timestamp: DateTime<Utc>) -> Option<RejectionRecord> {
        self.rejection.as_ref().map(|r| RejectionRecord {
            timestamp,
            sources: self.sources.clone(),
            kind: self.kind,
            pattern: self.pattern.clone(),
            stage: r.stage,
            score: r.score,
            reason: r.reason.to_string(),
        })
    }

    fn pass(&mut self, stage: Stage, score: f64, elapsed: Duration) {
        self.stages.push(StageOutcome {
            stage,
            passed: true,
            score,
            elapsed_us: elapsed.as_micros() as u64,
        });
    }

    fn reject(mut self, stage: Stage, score: f64, elapsed: Duration, reason: RejectionReason) -> Self {
        self.stages.push(StageOutcome {
            stage,
            passed: false,
            score,
            elapsed_us: elapsed.as_micros() as u64,
        });
        self.rejection = Some(Rejection {
            stage,
            score,
            reason,
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub validation_enabled: bool,
    pub performance_threshold: f64,
    pub performance_base_cost: f64,
    pub false_positive_threshold: f64,
    pub low_confidence_fp_factor: f64,
    pub strict_confidence_cutoff: f32,
    pub min_confidence: f32,
    pub workers: usize,
    pub stage_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &AutoUpdateConfig) -> Self {
        Self {
            validation_enabled: cfg.validation_enabled,
            performance_threshold: cfg.performance_threshold,
            performance_base_cost: cfg.performance_base_cost,
            false_positive_threshold: cfg.false_positive_threshold,
            low_confidence_fp_factor: cfg.low_confidence_fp_factor,
            strict_confidence_cutoff: cfg.strict_confidence_cutoff,
            min_confidence: cfg.min_confidence,
            workers: cfg.validation_workers,
            stage_timeout: cfg.stage_timeout(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AutoUpdateConfig::default())
    }
}

/// Compile a regex-kind pattern the way the engine will.
pub fn compile_regex(pattern: &str) -> Result<Regex, String> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(format!("pattern longer than {MAX_PATTERN_LEN} bytes"));
    }
    if pattern.matches('(').count() > MAX_GROUPS {
        return Err(format!("more than {MAX_GROUPS} groups"));
    }
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| e.to_string())
}

/// Latency multiplier from adding one pattern of `cost` to a snapshot
/// holding `regexes` regex patterns. `base` is the fixed per-lookup cost.
pub fn aggregate_ratio(base: f64, regexes: usize, cost: f64) -> f64 {
    let current = base.max(f64::MIN_POSITIVE) + regexes as f64;
    (current + cost) / current
}

fn check_domain(pattern: &str) -> Result<(), String> {
    match normalize_domain(pattern) {
        Some(d) if d == pattern => {}
        Some(d) => return Err(format!("not normalized (expected `{d}`)")),
        None => return Err("not a valid host name".into()),
    }
    if RESERVED_HOSTS.contains(&pattern) {
        return Err("reserved host".into());
    }
    Ok(())
}

#[derive(Clone)]
pub struct ValidationPipeline {
    settings: PipelineSettings,
    weights: ConfidenceWeights,
    corpus: Arc<CleanCorpus>,
    estimator: Arc<dyn CostEstimator>,
    /// Regex patterns in the snapshot candidates are measured against.
    snapshot_regexes: usize,
}

impl ValidationPipeline {
    pub fn new(
        settings: PipelineSettings,
        corpus: Arc<CleanCorpus>,
        estimator: Arc<dyn CostEstimator>,
    ) -> Self {
        Self {
            settings,
            weights: ConfidenceWeights::default(),
            corpus,
            estimator,
            snapshot_regexes: 0,
        }
    }

    /// Size of the live snapshot for the performance stage.
    pub fn set_snapshot_size(&mut self, regex_patterns: usize) {
        self.snapshot_regexes = regex_patterns;
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn confidence(&self, priorities: &[Priority]) -> f32 {
        self.weights.score(priorities)
    }

    /// Run all stages for one candidate on the current thread.
    pub fn validate(&self, c: &CandidateGroup) -> ValidationResult {
        self.run(c, &AtomicU8::new(0))
    }

    fn run(&self, c: &CandidateGroup, progress: &AtomicU8) -> ValidationResult {
        let s = &self.settings;
        let limit_ms = s.stage_timeout.as_millis() as u64;
        let confidence = self.weights.score(&c.priorities);
        let mut res = ValidationResult::start(c, confidence);

        // syntax
        progress.store(0, Ordering::Relaxed);
        let t = Instant::now();
        let compiled = match c.kind {
            PatternKind::Domain => check_domain(&c.pattern).map(|_| None),
            PatternKind::UrlRegex | PatternKind::CssRegex => compile_regex(&c.pattern).map(Some),
        };
        let elapsed = t.elapsed();
        let compiled = match compiled {
            Ok(re) => re,
            Err(msg) => return res.reject(Stage::Syntax, 0.0, elapsed, RejectionReason::Syntax(msg)),
        };
        if elapsed > s.stage_timeout {
            return res.reject(Stage::Syntax, 0.0, elapsed, RejectionReason::Timeout { ms: limit_ms });
        }
        res.pass(Stage::Syntax, 1.0, elapsed);

        if !s.validation_enabled {
            return res;
        }

        // performance
        progress.store(1, Ordering::Relaxed);
        let t = Instant::now();
        // domain rules share one hash lookup
        let cost = compiled
            .as_ref()
            .map(|re| self.estimator.cost(c.kind, re))
            .unwrap_or(0.0);
        let ratio = aggregate_ratio(s.performance_base_cost, self.snapshot_regexes, cost);
        let elapsed = t.elapsed();
        if elapsed > s.stage_timeout {
            return res.reject(Stage::Performance, ratio, elapsed, RejectionReason::Timeout { ms: limit_ms });
        }
        if !(ratio.is_finite() && ratio <= s.performance_threshold) {
            let reason = RejectionReason::Performance {
                cost: ratio,
                limit: s.performance_threshold,
            };
            return res.reject(Stage::Performance, ratio, elapsed, reason);
        }
        res.pass(Stage::Performance, ratio, elapsed);

        // false positives
        progress.store(2, Ordering::Relaxed);
        let t = Instant::now();
        let rate = match (&compiled, c.kind) {
            (None, _) => self.corpus.domain_match_rate(&c.pattern),
            (Some(re), PatternKind::CssRegex) => self.corpus.css_match_rate(re),
            (Some(re), _) => self.corpus.url_match_rate(re),
        };
        let elapsed = t.elapsed();
        let ceiling = fp_ceiling(
            s.false_positive_threshold,
            confidence,
            s.strict_confidence_cutoff,
            s.low_confidence_fp_factor,
        );
        if elapsed > s.stage_timeout {
            return res.reject(Stage::FalsePositive, rate, elapsed, RejectionReason::Timeout { ms: limit_ms });
        }
        if rate > ceiling {
            let reason = RejectionReason::FalsePositive { rate, ceiling };
            return res.reject(Stage::FalsePositive, rate, elapsed, reason);
        }
        res.pass(Stage::FalsePositive, rate, elapsed);

        // community confidence
        progress.store(3, Ordering::Relaxed);
        if confidence < s.min_confidence {
            let reason = RejectionReason::LowConfidence {
                score: confidence,
                min: s.min_confidence,
            };
            return res.reject(Stage::Community, confidence as f64, Duration::ZERO, reason);
        }
        res.pass(Stage::Community, confidence as f64, Duration::ZERO);
        res
    }

    /// Validate a batch on the blocking pool, at most `workers` at a time.
    /// Results come back in input order.
    pub async fn validate_batch(&self, groups: Vec<CandidateGroup>) -> Vec<ValidationResult> {
        let total = groups.len();
        if total == 0 {
            return Vec::new();
        }
        let sem = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        // one stage budget each, plus scheduling slack
        let budget = self.settings.stage_timeout * Stage::ALL.len() as u32 + Duration::from_millis(100);
        let mut set = JoinSet::new();

        for (idx, group) in groups.into_iter().enumerate() {
            let sem = Arc::clone(&sem);
            let pipeline = self.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let t0 = Instant::now();
                let progress = Arc::new(AtomicU8::new(0));
                let worker = pipeline.clone();
                let worker_group = group.clone();
                let worker_progress = Arc::clone(&progress);
                let handle = tokio::task::spawn_blocking(move || {
                    worker.run(&worker_group, &worker_progress)
                });
                let res = match tokio::time::timeout(budget, handle).await {
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => pipeline.abandoned(
                        &group,
                        &progress,
                        RejectionReason::Syntax(format!("validator task failed: {e}")),
                    ),
                    Err(_) => pipeline.abandoned(
                        &group,
                        &progress,
                        RejectionReason::Timeout {
                            ms: budget.as_millis() as u64,
                        },
                    ),
                };
                histogram!("autoupdate_validation_ms").record(t0.elapsed().as_secs_f64() * 1000.0);
                (idx, res)
            });
        }

        let mut out: Vec<Option<ValidationResult>> = vec![None; total];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, res)) => out[idx] = Some(res),
                Err(e) => tracing::error!(target: "validate", "validation task lost: {e}"),
            }
        }
        let results: Vec<ValidationResult> = out.into_iter().flatten().collect();

        let mut rejected = 0usize;
        for r in &results {
            if let Some(rej) = &r.rejection {
                rejected += 1;
                counter!("autoupdate_rejections_total", "stage" => rej.stage.as_str()).increment(1);
                tracing::debug!(
                    target: "validate",
                    kind = %r.kind,
                    pattern = %truncate(&r.pattern, 80),
                    stage = %rej.stage,
                    "rejected: {}",
                    rej.reason
                );
            }
        }
        tracing::info!(
            target: "validate",
            total,
            accepted = results.len() - rejected,
            rejected,
            "batch validated"
        );
        results
    }

    fn abandoned(&self, c: &CandidateGroup, progress: &AtomicU8, reason: RejectionReason) -> ValidationResult {
        let stage = Stage::ALL
            .get(progress.load(Ordering::Relaxed) as usize)
            .copied()
            .unwrap_or(Stage::Syntax);
        let res = ValidationResult::start(c, self.weights.score(&c.priorities));
        res.reject(stage, 0.0, Duration::ZERO, reason)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::cost::FixedCost;
    use super::*;

    fn pipeline(settings: PipelineSettings, cost: FixedCost) -> ValidationPipeline {
        ValidationPipeline::new(
            settings,
            Arc::new(CleanCorpus::default_seed()),
            Arc::new(cost),
        )
    }

    fn group(kind: PatternKind, pattern: &str, prios: &[Priority]) -> CandidateGroup {
        CandidateGroup {
            kind,
            pattern: pattern.into(),
            sources: (0..prios.len()).map(|i| format!("S{i}")).collect(),
            priorities: prios.to_vec(),
        }
    }

    fn stage_of(r: &ValidationResult) -> Option<Stage> {
        r.rejection.as_ref().map(|x| x.stage)
    }

    #[test]
    fn domain_candidates_pass_every_stage() {
        let p = pipeline(PipelineSettings::default(), FixedCost::new(1.0));
        let r = p.validate(&group(PatternKind::Domain, "pixel.tracker.example", &[Priority::High]));
        assert!(r.accepted());
        assert_eq!(r.stages.len(), 4);
        assert!(r.record().is_some());
    }

    #[test]
    fn each_stage_can_reject() {
        let p = pipeline(PipelineSettings::default(), FixedCost::new(1.0).with(r"slow.*(a|b)+", 50.0));
        let hi = [Priority::High];
        let cases = [
            (group(PatternKind::UrlRegex, "(unclosed", &hi), Stage::Syntax),
            (group(PatternKind::Domain, "Not_Normal.COM", &hi), Stage::Syntax),
            (group(PatternKind::Domain, "localhost", &hi), Stage::Syntax),
            (group(PatternKind::UrlRegex, r"slow.*(a|b)+", &hi), Stage::Performance),
            (group(PatternKind::Domain, "paypal.com", &hi), Stage::FalsePositive),
            (group(PatternKind::UrlRegex, r"^https://", &hi), Stage::FalsePositive),
            (group(PatternKind::Domain, "tracker.example.net", &[Priority::Low]), Stage::Community),
        ];
        let mut settings = PipelineSettings::default();
        settings.min_confidence = 0.6;
        let strict = ValidationPipeline::new(
            settings,
            Arc::new(CleanCorpus::default_seed()),
            Arc::new(FixedCost::new(1.0).with(r"slow.*(a|b)+", 50.0)),
        );
        for (c, expected) in &cases[..6] {
            assert_eq!(stage_of(&p.validate(c)), Some(*expected), "{}", c.pattern);
        }
        let (c, expected) = &cases[6];
        assert_eq!(stage_of(&strict.validate(c)), Some(*expected));
    }

    #[test]
    fn performance_limit_scales_with_snapshot_size() {
        let cost = FixedCost::new(1.9).with(r"heavy\d+(x|y)*", 15.0);
        let mut p = pipeline(PipelineSettings::default(), cost);
        let heavy = group(PatternKind::UrlRegex, r"heavy\d+(x|y)*", &[Priority::High]);
        let css = group(PatternKind::CssRegex, r"display:\s*none", &[Priority::High]);

        let r = p.validate(&heavy);
        assert_eq!(stage_of(&r), Some(Stage::Performance));
        let perf = r.stages.iter().find(|o| o.stage == Stage::Performance).unwrap();
        assert!((perf.score - 2.5).abs() < 1e-9);
        assert!(p.validate(&css).accepted());

        p.set_snapshot_size(20);
        assert!(p.validate(&heavy).accepted());
    }

    #[test]
    fn domain_rules_add_no_regex_cost() {
        let p = pipeline(PipelineSettings::default(), FixedCost::new(1000.0));
        let r = p.validate(&group(PatternKind::Domain, "pixel.tracker.example", &[Priority::High]));
        assert!(r.accepted());
        assert_eq!(r.stages[1].score, 1.0);
    }

    #[test]
    fn stricter_fp_ceiling_for_low_confidence() {
        // matches exactly one clean URL
        let mut settings = PipelineSettings::default();
        settings.false_positive_threshold = 0.01;
        let p = pipeline(settings, FixedCost::new(1.0));
        let pattern = r"mail\.paypal\.com/inbox";
        let strong = p.validate(&group(PatternKind::UrlRegex, pattern, &[Priority::High]));
        let weak = p.validate(&group(PatternKind::UrlRegex, pattern, &[Priority::Low]));
        assert!(strong.accepted());
        assert_eq!(stage_of(&weak), Some(Stage::FalsePositive));
    }

    #[test]
    fn disabled_validation_keeps_only_syntax() {
        let mut settings = PipelineSettings::default();
        settings.validation_enabled = false;
        let p = pipeline(settings, FixedCost::new(100.0));
        let ok = p.validate(&group(PatternKind::Domain, "gmail.com", &[Priority::Low]));
        assert!(ok.accepted());
        assert_eq!(ok.stages.len(), 1);
        let bad = p.validate(&group(PatternKind::CssRegex, "[", &[Priority::High]));
        assert_eq!(stage_of(&bad), Some(Stage::Syntax));
    }

    #[tokio::test]
    async fn batch_preserves_order_and_resolves_all() {
        let p = pipeline(PipelineSettings::default(), FixedCost::new(1.0));
        let groups: Vec<CandidateGroup> = (0..20)
            .map(|i| group(PatternKind::Domain, &format!("t{i}.tracker.example"), &[Priority::High]))
            .chain(std::iter::once(group(PatternKind::Domain, "gmail.com", &[Priority::High])))
            .collect();
        let res = p.validate_batch(groups).await;
        assert_eq!(res.len(), 21);
        assert_eq!(res[3].pattern, "t3.tracker.example");
        assert_eq!(res.iter().filter(|r| r.accepted()).count(), 20);
        let rec = res[20].rejection_record(Utc::now()).unwrap();
        assert_eq!(rec.stage, Stage::FalsePositive);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
