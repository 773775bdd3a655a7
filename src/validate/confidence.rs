// src/validate/confidence.rs
//! # Community Confidence
//!
//! Maps the priority tiers of the sources listing a pattern to a confidence
//! in `[0.0, 1.0]`. The strongest source sets the base and each additional
//! corroborating source adds a fixed bonus.

use serde::Deserialize;

use crate::model::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ConfidenceWeights {
    #[serde(default = "default_high")]
    pub high: f32,
    #[serde(default = "default_medium")]
    pub medium: f32,
    #[serde(default = "default_low")]
    pub low: f32,
    /// Added per source beyond the first.
    #[serde(default = "default_bonus")]
    pub corroboration_bonus: f32,
}

fn default_high() -> f32 {
    0.9
}
fn default_medium() -> f32 {
    0.7
}
fn default_low() -> f32 {
    0.5
}
fn default_bonus() -> f32 {
    0.15
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            high: default_high(),
            medium: default_medium(),
            low: default_low(),
            corroboration_bonus: default_bonus(),
        }
    }
}

impl ConfidenceWeights {
    pub fn weight_for(&self, p: Priority) -> f32 {
        clamp01(match p {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        })
    }

    /// Confidence for a pattern listed by sources of the given tiers.
    pub fn score(&self, priorities: &[Priority]) -> f32 {
        let Some(base) = priorities
            .iter()
            .map(|p| self.weight_for(*p))
            .max_by(|a, b| a.total_cmp(b))
        else {
            return 0.0;
        };
        let extra = priorities.len().saturating_sub(1) as f32;
        clamp01(base + extra * self.corroboration_bonus)
    }
}

/// False-positive ceiling for a candidate of the given confidence.
pub fn fp_ceiling(base: f64, confidence: f32, strict_cutoff: f32, low_factor: f64) -> f64 {
    if confidence < strict_cutoff {
        base * low_factor
    } else {
        base
    }
}

fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}
