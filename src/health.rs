//! # Health Window
//! Samples of live-engine behaviour and the window verdict built from them.
//!
//! A verdict uses the median of each metric over the window, so one outlier
//! sample can never breach a threshold on its own. Fewer than
//! `MIN_WINDOW_SAMPLES` samples yield no verdict at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::AutoUpdateConfig;
use crate::engine::EngineHandle;
use crate::model::VersionId;
use crate::validate::corpus::CleanCorpus;

pub const MIN_WINDOW_SAMPLES: usize = 3;
/// Latency ratios are taken against at least this many microseconds.
pub const LATENCY_FLOOR_US: f64 = 5.0;

/// One measurement attributed to the version that was active.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub version: VersionId,
    /// Mean per-lookup latency.
    pub latency_us: f64,
    pub lookups: u64,
    pub false_positives: u64,
    pub errors: u64,
}

impl HealthSample {
    /// A sample that could not be taken, charged to `version` as one error.
    pub fn failed(version: VersionId) -> Self {
        Self {
            timestamp: Utc::now(),
            version,
            latency_us: 0.0,
            lookups: 1,
            false_positives: 0,
            errors: 1,
        }
    }

    pub fn fp_rate(&self) -> f64 {
        ratio(self.false_positives, self.lookups)
    }

    pub fn error_rate(&self) -> f64 {
        ratio(self.errors, self.lookups)
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthThresholds {
    pub performance_threshold: f64,
    pub false_positive_threshold: f64,
    pub max_error_rate: f64,
}

impl HealthThresholds {
    pub fn from_config(cfg: &AutoUpdateConfig) -> Self {
        Self {
            performance_threshold: cfg.performance_threshold,
            false_positive_threshold: cfg.false_positive_threshold,
            max_error_rate: cfg.max_error_rate,
        }
    }

    /// Whether a single sample is over any threshold.
    pub fn sample_breaches(&self, s: &HealthSample, baseline_us: Option<f64>) -> bool {
        let latency = baseline_us
            .map(|b| s.latency_us / b.max(LATENCY_FLOOR_US) > self.performance_threshold)
            .unwrap_or(false);
        latency
            || s.fp_rate() > self.false_positive_threshold
            || s.error_rate() > self.max_error_rate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Breach {
    Latency { ratio: f64, limit: f64 },
    FalsePositives { rate: f64, ceiling: f64 },
    Errors { rate: f64, ceiling: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthVerdict {
    pub version: VersionId,
    pub at: DateTime<Utc>,
    pub samples: usize,
    pub healthy: bool,
    pub median_latency_us: f64,
    pub baseline_latency_us: Option<f64>,
    pub median_fp_rate: f64,
    pub median_error_rate: f64,
    pub breaches: Vec<Breach>,
}

fn median(mut xs: Vec<f64>) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.sort_by(|a, b| a.total_cmp(b));
    let mid = xs.len() / 2;
    if xs.len() % 2 == 0 {
        (xs[mid - 1] + xs[mid]) / 2.0
    } else {
        xs[mid]
    }
}

/// Verdict over `samples`; `None` below the minimum window size.
pub fn evaluate(
    version: VersionId,
    samples: &[HealthSample],
    baseline_us: Option<f64>,
    th: &HealthThresholds,
) -> Option<HealthVerdict> {
    if samples.len() < MIN_WINDOW_SAMPLES {
        return None;
    }
    let lat = median(samples.iter().map(|s| s.latency_us).collect());
    let fp = median(samples.iter().map(HealthSample::fp_rate).collect());
    let err = median(samples.iter().map(HealthSample::error_rate).collect());

    let mut breaches = Vec::new();
    if let Some(b) = baseline_us {
        let r = lat / b.max(LATENCY_FLOOR_US);
        if r > th.performance_threshold {
            breaches.push(Breach::Latency {
                ratio: r,
                limit: th.performance_threshold,
            });
        }
    }
    if fp > th.false_positive_threshold {
        breaches.push(Breach::FalsePositives {
            rate: fp,
            ceiling: th.false_positive_threshold,
        });
    }
    if err > th.max_error_rate {
        breaches.push(Breach::Errors {
            rate: err,
            ceiling: th.max_error_rate,
        });
    }
    Some(HealthVerdict {
        version,
        at: Utc::now(),
        samples: samples.len(),
        healthy: breaches.is_empty(),
        median_latency_us: lat,
        baseline_latency_us: baseline_us,
        median_fp_rate: fp,
        median_error_rate: err,
        breaches,
    })
}

/// Thread-safe bounded window of recent samples.
#[derive(Debug)]
pub struct HealthWindow {
    inner: Mutex<VecDeque<HealthSample>>,
    capacity: usize,
}

impl HealthWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, sample: HealthSample) {
        let mut buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.push_back(sample);
        while buf.len() > self.capacity {
            buf.pop_front();
        }
    }

    /// Samples attributed to `version`, oldest first.
    pub fn samples_for(&self, version: VersionId) -> Vec<HealthSample> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().filter(|s| s.version == version).cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn sample(&self, engine: &EngineHandle) -> HealthSample;
}

/// Runs clean and tracker-shaped traffic through the snapshot. Any clean URL
/// that matches counts as a false positive; a panicking lookup is an error.
#[derive(Clone)]
pub struct SyntheticProbe {
    clean: Arc<Vec<String>>,
    traffic: Arc<Vec<String>>,
}

impl SyntheticProbe {
    pub fn new(clean: Vec<String>, traffic: Vec<String>) -> Self {
        Self {
            clean: Arc::new(clean),
            traffic: Arc::new(traffic),
        }
    }

    pub fn from_corpus(corpus: &CleanCorpus) -> Self {
        let traffic = corpus
            .domains()
            .iter()
            .take(25)
            .map(|d| format!("https://pixel.{d}.mail-open.test/o.gif?id=1"))
            .collect();
        Self::new(corpus.urls().to_vec(), traffic)
    }

    fn run(&self, engine: &EngineHandle) -> HealthSample {
        let mut lookups = 0u64;
        let mut fps = 0u64;
        let mut errors = 0u64;
        let t0 = Instant::now();
        for url in self.clean.iter().chain(self.traffic.iter()) {
            lookups += 1;
            match catch_unwind(AssertUnwindSafe(|| engine.match_url(url))) {
                Ok(hits) => {
                    if !hits.is_empty() && lookups as usize <= self.clean.len() {
                        fps += 1;
                    }
                }
                Err(_) => errors += 1,
            }
        }
        let elapsed_us = t0.elapsed().as_secs_f64() * 1e6;
        HealthSample {
            timestamp: Utc::now(),
            version: engine.version(),
            latency_us: if lookups == 0 { 0.0 } else { elapsed_us / lookups as f64 },
            lookups,
            false_positives: fps,
            errors,
        }
    }
}

#[async_trait]
impl HealthProbe for SyntheticProbe {
    async fn sample(&self, engine: &EngineHandle) -> HealthSample {
        let version = engine.version();
        let engine = engine.clone();
        let probe = self.clone();
        match tokio::task::spawn_blocking(move || probe.run(&engine)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target: "health", version = version.0, "sampling task failed: {e}");
                HealthSample::failed(version)
            }
        }
    }
}

// --- Test helper ---

/// Shape of one scripted sample; the version is taken from the sampled handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleShape {
    pub latency_us: f64,
    pub false_positives: u64,
    pub errors: u64,
}

impl SampleShape {
    pub fn latency(latency_us: f64) -> Self {
        Self {
            latency_us,
            false_positives: 0,
            errors: 0,
        }
    }
}

/// Serves queued sample shapes, then repeats `fallback`.
pub struct ScriptedProbe {
    queue: Mutex<VecDeque<SampleShape>>,
    fallback: SampleShape,
    lookups: u64,
}

impl ScriptedProbe {
    pub fn new(fallback: SampleShape) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            lookups: 1000,
        }
    }

    pub fn push(&self, shape: SampleShape) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(shape);
    }

    pub fn push_n(&self, n: usize, shape: SampleShape) {
        for _ in 0..n {
            self.push(shape);
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn sample(&self, engine: &EngineHandle) -> HealthSample {
        let shape = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(self.fallback);
        HealthSample {
            timestamp: Utc::now(),
            version: engine.version(),
            latency_us: shape.latency_us,
            lookups: self.lookups,
            false_positives: shape.false_positives,
            errors: shape.errors,
        }
    }
}
