// src/validate/cost.rs
//! Matching-cost estimation for regex candidates, as a multiple of the cost
//! of a plain literal pattern over the same benchmark corpus.

use regex::{Regex, RegexBuilder};
use std::time::Instant;

use crate::model::PatternKind;

pub trait CostEstimator: Send + Sync {
    /// Estimated evaluation cost of `re` relative to baseline (1.0 == baseline).
    fn cost(&self, kind: PatternKind, re: &Regex) -> f64;
}

/// Times each candidate over the benchmark corpus.
pub struct BenchmarkEstimator {
    samples: Vec<String>,
    rounds: usize,
    baseline_ns: f64,
}

/// Reference patterns defining 1.0x.
const BASELINE_PATTERNS: &[&str] = &[r"tracker\.example\.com", r"/pixel\.gif", r"\.open-beacon"];

impl BenchmarkEstimator {
    pub fn new(samples: Vec<String>) -> Self {
        Self::with_rounds(samples, 7)
    }

    pub fn with_rounds(samples: Vec<String>, rounds: usize) -> Self {
        let mut est = Self {
            samples,
            rounds: rounds.max(1),
            baseline_ns: 1.0,
        };
        let refs: Vec<f64> = BASELINE_PATTERNS
            .iter()
            .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
            .map(|re| est.measure_ns(&re))
            .collect();
        let mean = refs.iter().sum::<f64>() / refs.len().max(1) as f64;
        est.baseline_ns = mean.max(1.0);
        tracing::debug!(target: "validate", baseline_ns = est.baseline_ns, samples = est.samples.len(), "cost baseline measured");
        est
    }

    /// Fastest of `rounds` passes over the corpus.
    fn measure_ns(&self, re: &Regex) -> f64 {
        (0..self.rounds)
            .map(|_| {
                let t0 = Instant::now();
                let mut hits = 0usize;
                for s in &self.samples {
                    if re.is_match(s) {
                        hits += 1;
                    }
                }
                std::hint::black_box(hits);
                t0.elapsed().as_nanos() as f64
            })
            .fold(f64::INFINITY, f64::min)
    }
}

impl CostEstimator for BenchmarkEstimator {
    fn cost(&self, _kind: PatternKind, re: &Regex) -> f64 {
        self.measure_ns(re) / self.baseline_ns
    }
}

// --- Test helper ---

/// Same cost for every pattern, or a per-pattern override.
#[derive(Debug, Clone, Default)]
pub struct FixedCost {
    pub default: f64,
    pub overrides: Vec<(String, f64)>,
}

impl FixedCost {
    pub fn new(default: f64) -> Self {
        Self {
            default,
            overrides: Vec::new(),
        }
    }

    pub fn with(mut self, pattern: &str, cost: f64) -> Self {
        self.overrides.push((pattern.to_string(), cost));
        self
    }
}

impl CostEstimator for FixedCost {
    fn cost(&self, _kind: PatternKind, re: &Regex) -> f64 {
        self.overrides
            .iter()
            .find(|(p, _)| p == re.as_str())
            .map(|(_, c)| *c)
            .unwrap_or(self.default)
    }
}
